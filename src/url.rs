// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device URL parsing and authority resolution.
//!
//! `dig2://<authority>[/<path>][?<query>][#<fragment>]`. The whole URL is
//! case-insensitive; it is lowercased before parsing so every projection is
//! identical regardless of input casing. The scheme may be omitted, matching
//! what callers pass after an outer layer has already stripped it.

use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use crate::prelude::*;

/// `.internal` is a reserved TLD (RFC 6762 appendix G).
const AUTHORITY_INTERNAL: &str = "caen.internal";
const AUTHORITY_LEGACY_USB_PREFIX: &str = "usb:";
const PATH_OPENARM: &str = "/openarm";
const PATH_USB_PREFIX: &str = "/usb/";
const PATH_USB: &str = "/usb";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlData {
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub monitor: bool,
    pub log_level: Option<String>,
    pub pid: Option<String>,
    pub keepalive: Option<u32>,
    pub rcvbuf: Option<usize>,
    pub receiver_thread_affinity: Option<usize>,
}

pub fn parse_url(url: &str) -> Result<UrlData> {
    let full = if url.contains("://") {
        url.to_ascii_lowercase()
    } else {
        format!("dig2://{}", url.to_ascii_lowercase())
    };

    let (scheme, rest) = full
        .split_once("://")
        .ok_or_else(|| Error::InvalidArgument(format!("invalid URL: {url}")))?;

    let (rest, fragment) = match rest.split_once('#') {
        Some((rest, fragment)) => (rest, fragment),
        None => (rest, ""),
    };
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, query),
        None => (rest, ""),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    if authority.is_empty() {
        return Err(Error::InvalidArgument(format!("invalid URL: {url}")));
    }

    let mut data = UrlData {
        scheme: scheme.to_owned(),
        authority: authority.to_owned(),
        path: path.to_owned(),
        query: query.to_owned(),
        fragment: fragment.to_owned(),
        ..Default::default()
    };

    for item in query.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = item.split_once('=').unwrap_or((item, ""));
        match key {
            "monitor" => data.monitor = true,
            "log_level" => data.log_level = Some(value.to_owned()),
            "pid" => data.pid = Some(value.to_owned()),
            "keepalive" => data.keepalive = Some(parse_query_number(key, value)?),
            "rcvbuf" => data.rcvbuf = Some(parse_query_number(key, value)?),
            "receiver_thread_affinity" => {
                data.receiver_thread_affinity = Some(parse_query_number(key, value)?);
            }
            // Unknown options are ignored for forward compatibility.
            _ => {}
        }
    }

    Ok(data)
}

fn parse_query_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid {key} value: {value}")))
}

/// Map a numeric USB PID to its deterministic address in the ULA range
/// `fda7:cae0::/32`: the PID occupies the low 32 bits.
fn pid_to_ipv6(pid_str: &str) -> Result<String> {
    let pid: u32 = pid_str
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid PID: {pid_str}")))?;
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&[0xfd, 0xa7, 0xca, 0xe0]);
    bytes[12..].copy_from_slice(&pid.to_be_bytes());
    Ok(Ipv6Addr::from(bytes).to_string())
}

/// Resolve the URL authority to the host string handed to the resolver.
pub fn url_to_address(data: &UrlData) -> Result<String> {
    if data.authority == AUTHORITY_INTERNAL {
        // dig2://caen.internal/openarm: the library runs inside the device's
        // own container environment, where "localhost" would point at the
        // container; the alias maps to the container host address instead.
        if data.path == PATH_OPENARM {
            return Ok(Ipv4Addr::new(172, 17, 0, 1).to_string());
        }

        // dig2://caen.internal/usb/PID
        if let Some(pid) = data.path.strip_prefix(PATH_USB_PREFIX) {
            return pid_to_ipv6(pid);
        }

        // dig2://caen.internal/usb?pid=PID
        if data.path == PATH_USB {
            let pid = data
                .pid
                .as_deref()
                .ok_or_else(|| Error::InvalidArgument("usb path requires pid query".into()))?;
            return pid_to_ipv6(pid);
        }
    }

    // Legacy usb:PID authority.
    if let Some(pid) = data.authority.strip_prefix(AUTHORITY_LEGACY_USB_PREFIX) {
        return pid_to_ipv6(pid);
    }

    // RFC 2732 bracketed IPv6: strip the brackets when the inner text is a
    // valid address, otherwise leave the authority untouched.
    if data.authority.len() > 2 && data.authority.starts_with('[') && data.authority.ends_with(']')
    {
        let inner = &data.authority[1..data.authority.len() - 1];
        if inner.parse::<Ipv6Addr>().is_ok() {
            return Ok(inner.to_owned());
        }
    }

    Ok(data.authority.clone())
}
