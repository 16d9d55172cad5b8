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

//! The device session: owns the command channel, mirrors the endpoint part
//! of the device tree, and routes commands and data reads to the endpoints.

use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use socket2::TcpKeepalive;

use crate::channel::CommandChannel;
use crate::endpoint::Endpoint;
use crate::endpoint::HwEndpoint;
use crate::endpoint::Params;
use crate::endpoint::SwEndpoint;
use crate::endpoint::dpp::DppEndpoint;
use crate::endpoint::dpp::Flavor;
use crate::endpoint::dppzle::DppZle;
use crate::endpoint::events::SpecialEvents;
use crate::endpoint::opendpp::OpenDpp;
use crate::endpoint::raw::RawEndpoint;
use crate::endpoint::rawudp::RawUdpEndpoint;
use crate::endpoint::scope::Scope;
use crate::endpoint::stats::ChannelStats;
use crate::handle::NodeId;
use crate::logging;
use crate::prelude::*;
use crate::protocol;
use crate::protocol::Command;
use crate::protocol::NodeType;
use crate::protocol::Reply;
use crate::protocol::ReplyFlag;
use crate::protocol::Request;
use crate::sink::Slot;
use crate::url;
use crate::url::UrlData;

/// The handle value sent with `connect` is arbitrary: the command is the one
/// exchange that does not address a node.
const CONNECT_HANDLE: NodeId = 0x67696F;

/// Fixed maximum of the auxiliary open-data pipeline; its size parameter can
/// change during a run, so the buffers are sized for the worst case.
const OPENDATA_MAX_SIZE: usize = 1 << 26;

const USER_REGISTER_PATH: &str = "/par/registeruser";

/// Command-channel core shared with the endpoints: the serialized JSON
/// exchange plus the session constants read at connect time. Endpoints hold
/// an `Arc` of this; the session owns the endpoints, so there is no cycle.
pub struct ControlCore {
    channel: CommandChannel,
    digitizer: NodeId,
    url: UrlData,
    n_channels: usize,
    sampling_period_ns: f64,
}

impl ControlCore {
    fn exchange(&self, request: &Request) -> Result<Reply> {
        self.channel.exchange(request)
    }

    pub fn digitizer(&self) -> NodeId {
        self.digitizer
    }

    pub fn url(&self) -> &UrlData {
        &self.url
    }

    fn first_value(reply: Reply) -> Result<String> {
        reply
            .value
            .into_iter()
            .next()
            .ok_or_else(|| Error::Communication("empty reply value".into()))
    }

    pub fn get_value(&self, handle: NodeId, path: &str) -> Result<String> {
        Self::first_value(self.exchange(&Request::new(Command::GetValue, handle, path))?)
    }

    pub fn get_value_with_arg(&self, handle: NodeId, path: &str, arg: &str) -> Result<String> {
        Self::first_value(
            self.exchange(&Request::new(Command::GetValue, handle, path).with_value(arg))?,
        )
    }

    pub fn set_value(&self, handle: NodeId, path: &str, value: &str) -> Result<()> {
        self.exchange(&Request::new(Command::SetValue, handle, path).with_value(value))?;
        Ok(())
    }

    pub fn multi_get_value(&self, handle: NodeId, paths: Vec<String>) -> Result<Vec<String>> {
        let reply = self.exchange(
            &Request::new(Command::MultiGetValue, handle, "").with_multiple_query(paths),
        )?;
        Ok(reply.value)
    }

    pub fn multi_set_value(
        &self,
        handle: NodeId,
        paths: Vec<String>,
        values: Vec<String>,
    ) -> Result<()> {
        if paths.len() != values.len() {
            return Err(Error::InvalidArgument(format!(
                "{} paths but {} values",
                paths.len(),
                values.len()
            )));
        }
        self.exchange(
            &Request::new(Command::MultiSetValue, handle, "")
                .with_multiple_query(paths)
                .with_multiple_value(values),
        )?;
        Ok(())
    }

    pub fn get_device_tree(&self, handle: NodeId) -> Result<String> {
        Self::first_value(self.exchange(&Request::new(Command::GetDeviceTree, handle, ""))?)
    }

    pub fn get_child_handles(&self, handle: NodeId, path: &str) -> Result<Vec<NodeId>> {
        let reply = self.exchange(&Request::new(Command::GetChildHandles, handle, path))?;
        reply
            .value
            .iter()
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| Error::Communication(format!("invalid handle: {value}")))
            })
            .collect()
    }

    pub fn get_handle(&self, handle: NodeId, path: &str) -> Result<NodeId> {
        Self::first_value(self.exchange(&Request::new(Command::GetHandle, handle, path))?)?
            .parse()
            .map_err(|_| Error::Communication("invalid handle in reply".into()))
    }

    pub fn get_parent_handle(&self, handle: NodeId, path: &str) -> Result<NodeId> {
        Self::first_value(self.exchange(&Request::new(Command::GetParentHandle, handle, path))?)?
            .parse()
            .map_err(|_| Error::Communication("invalid handle in reply".into()))
    }

    pub fn get_path(&self, handle: NodeId) -> Result<String> {
        Self::first_value(self.exchange(&Request::new(Command::GetPath, handle, ""))?)
    }

    pub fn get_node_properties(&self, handle: NodeId, path: &str) -> Result<(String, NodeType)> {
        let reply = self.exchange(&Request::new(Command::GetNodeProperties, handle, path))?;
        let mut values = reply.value.into_iter();
        let name = values
            .next()
            .ok_or_else(|| Error::Communication("missing node name".into()))?;
        let node_type = values
            .next()
            .map(|value| {
                serde_json::from_value(serde_json::Value::String(value))
                    .unwrap_or(NodeType::Unknown)
            })
            .unwrap_or(NodeType::Unknown);
        Ok((name, node_type))
    }

    pub fn send_command(&self, handle: NodeId, path: &str) -> Result<Reply> {
        self.exchange(&Request::new(Command::SendCommand, handle, path))
    }
}

impl Params for ControlCore {
    fn n_channels(&self) -> usize {
        self.n_channels
    }

    fn sampling_period_ns(&self) -> f64 {
        self.sampling_period_ns
    }

    fn value(&self, path: &str) -> Result<String> {
        self.get_value(self.digitizer, path)
    }

    fn value_with_arg(&self, path: &str, arg: &str) -> Result<String> {
        self.get_value_with_arg(self.digitizer, path, arg)
    }

    fn active_endpoint(&self) -> Result<String> {
        self.get_value(self.digitizer, "/endpoint/par/activeendpoint")
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

pub struct Client {
    core: Arc<ControlCore>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    hw_endpoints: Vec<Arc<dyn HwEndpoint>>,
    address: IpAddr,
    endpoint_address: IpAddr,
    server_version_aligned: bool,
    monitor: bool,
}

impl Client {
    /// Open a session from a device URL.
    pub fn open(url: &str) -> Result<Self> {
        logging::init();
        let data = url::parse_url(url)?;
        let host = url::url_to_address(&data)?;
        let addr = (host.as_str(), protocol::COMMAND_PORT)
            .to_socket_addrs()
            .map_err(|err| Error::DeviceNotFound(err.to_string()))?
            .next()
            .ok_or_else(|| Error::DeviceNotFound(format!("{host} does not resolve")))?;
        Self::open_at(addr, data)
    }

    /// Open a session against an explicit control-channel address.
    pub fn open_at(addr: SocketAddr, data: UrlData) -> Result<Self> {
        logging::init();
        let channel = CommandChannel::connect(addr)?;

        // Keep-alive patches rare missing data from the device.
        let keepalive = data.keepalive.unwrap_or(4);
        if keepalive != 0 {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(keepalive.into()))
                .with_interval(Duration::from_secs(keepalive.into()))
                .with_retries(20);
            SockRef::from(&*channel.stream()).set_tcp_keepalive(&keepalive)?;
        }

        let monitor = data.monitor;
        let role = if monitor { "monitor" } else { "client" };
        let reply = channel.exchange(
            &Request::new(Command::Connect, CONNECT_HANDLE, "").with_value(role),
        )?;

        let mut values = reply.value.into_iter();
        let digitizer: NodeId = values
            .next()
            .ok_or_else(|| Error::Communication("invalid reply from the server".into()))?
            .parse()
            .map_err(|_| Error::Communication("invalid digitizer handle".into()))?;

        let server_version_aligned = match values.next() {
            Some(version) => {
                let version: u32 = version
                    .parse()
                    .map_err(|_| Error::Communication(format!("invalid version: {version}")))?;
                info!(version, "server version");
                // The patch number does not participate in the handshake.
                version / protocol::VERSION_PATCH_MODULUS
                    <= protocol::VERSION / protocol::VERSION_PATCH_MODULUS
            }
            None => false,
        };
        if !server_version_aligned {
            warn!(
                client = protocol::VERSION,
                "server version ahead of this library; session degraded to best effort"
            );
        }

        let mut core = ControlCore {
            channel,
            digitizer,
            url: data,
            n_channels: 0,
            sampling_period_ns: 0.0,
        };
        core.n_channels = core
            .get_value(digitizer, "/par/numch")?
            .parse()
            .map_err(|_| Error::Communication("invalid channel count".into()))?;
        let adc_samplrate_mhz: f64 = core
            .get_value(digitizer, "/par/adc_samplrate")?
            .parse()
            .map_err(|_| Error::Communication("invalid sampling rate".into()))?;
        core.sampling_period_ns = 1e3 / adc_samplrate_mhz;

        let core = Arc::new(core);
        let endpoint_address = compute_endpoint_address(&core, addr.ip());

        let mut client = Self {
            core,
            endpoints: Vec::new(),
            hw_endpoints: Vec::new(),
            address: addr.ip(),
            endpoint_address,
            server_version_aligned,
            monitor,
        };
        if !monitor {
            client.initialize_endpoints()?;
        }
        Ok(client)
    }

    fn initialize_endpoints(&mut self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let params: Arc<dyn Params> = self.core.clone();
        let mut hw: Option<Arc<dyn HwEndpoint>> = None;
        let mut sw_list: Vec<Arc<dyn SwEndpoint>> = Vec::new();

        for node in core.get_child_handles(core.digitizer, "/endpoint")? {
            let (name, node_type) = core.get_node_properties(node, "")?;
            if node_type != NodeType::Endpoint {
                continue;
            }
            debug!(%name, node, "endpoint node");
            match name.as_str() {
                "raw" => {
                    let port: u16 = core
                        .get_value(node, "/port")?
                        .parse()
                        .map_err(|_| Error::Communication("invalid data port".into()))?;
                    let endpoint = RawEndpoint::new(
                        node,
                        self.endpoint_address,
                        port,
                        core.url(),
                        format!("raw {node:#x}"),
                    )?;
                    install_getters(&*endpoint, &core, "raw");
                    if hw.is_some() {
                        return Err(Error::Internal(
                            "more than one hardware endpoint".into(),
                        ));
                    }
                    hw = Some(endpoint.clone());
                    self.endpoints.push(endpoint);
                }
                "rawudp" => {
                    let endpoint = RawUdpEndpoint::new(
                        node,
                        self.endpoint_address,
                        protocol::UDP_PORT,
                        core.url(),
                        &params,
                        format!("rawudp {node:#x}"),
                    )?;
                    install_getters(&*endpoint, &core, "rawudp");
                    if hw.is_some() {
                        return Err(Error::Internal(
                            "more than one hardware endpoint".into(),
                        ));
                    }
                    hw = Some(endpoint.clone());
                    self.endpoints.push(endpoint);
                }
                "opendata" => {
                    // Auxiliary raw pipeline with a fixed worst-case size;
                    // never decoded and never the main hardware endpoint.
                    let port: u16 = core
                        .get_value(node, "/port")?
                        .parse()
                        .map_err(|_| Error::Communication("invalid data port".into()))?;
                    let endpoint = RawEndpoint::new(
                        node,
                        self.endpoint_address,
                        port,
                        core.url(),
                        format!("opendata {node:#x}"),
                    )?;
                    endpoint.set_max_size_getter(Box::new(|| Ok(OPENDATA_MAX_SIZE)));
                    endpoint.set_is_decoded_getter(Box::new(|| Ok(false)));
                    self.endpoints.push(endpoint);
                }
                "scope" => {
                    let endpoint = Scope::new(node, Arc::clone(&params));
                    sw_list.push(endpoint.clone());
                    self.endpoints.push(endpoint);
                }
                "opendpp" => {
                    let endpoint = OpenDpp::new(node, Arc::clone(&params));
                    sw_list.push(endpoint.clone());
                    self.endpoints.push(endpoint);
                }
                "dpppha" | "dpppsd" => {
                    let flavor = if name == "dpppha" {
                        Flavor::Pha
                    } else {
                        Flavor::Psd
                    };
                    let stats_node = core.get_handle(node, "/stats")?;
                    let stats = ChannelStats::new(stats_node, &params);
                    let endpoint =
                        DppEndpoint::new(flavor, node, stats.clone(), Arc::clone(&params));
                    sw_list.push(endpoint.clone());
                    self.endpoints.push(endpoint);
                    self.endpoints.push(stats);
                }
                "dppzle" => {
                    let endpoint = DppZle::new(node, Arc::clone(&params));
                    sw_list.push(endpoint.clone());
                    self.endpoints.push(endpoint);
                }
                other => {
                    return Err(Error::Generic(format!(
                        "unsupported software endpoint {other}"
                    )));
                }
            }
        }

        let hw = hw.ok_or_else(|| Error::Generic("hardware endpoint not found".into()))?;

        // The implicit events decoder consumes the start/stop framing and is
        // never user addressable.
        let events = SpecialEvents::new(hw.pending_stop_flag());
        sw_list.push(events);

        for endpoint in sw_list {
            hw.register_sw_endpoint(endpoint);
        }
        self.hw_endpoints.push(hw);
        Ok(())
    }

    fn find_endpoint(&self, node: NodeId, operation: &str) -> Result<&Arc<dyn Endpoint>> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.node() == node)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{operation} allowed only on endpoint handles"))
            })
    }

    // Node API.

    pub fn get_device_tree(&self, handle: NodeId) -> Result<String> {
        self.core.get_device_tree(handle)
    }

    pub fn get_child_handles(&self, handle: NodeId, path: &str) -> Result<Vec<NodeId>> {
        self.core.get_child_handles(handle, path)
    }

    pub fn get_handle(&self, handle: NodeId, path: &str) -> Result<NodeId> {
        self.core.get_handle(handle, path)
    }

    pub fn get_parent_handle(&self, handle: NodeId, path: &str) -> Result<NodeId> {
        self.core.get_parent_handle(handle, path)
    }

    pub fn get_path(&self, handle: NodeId) -> Result<String> {
        self.core.get_path(handle)
    }

    pub fn get_node_properties(&self, handle: NodeId, path: &str) -> Result<(String, NodeType)> {
        self.core.get_node_properties(handle, path)
    }

    pub fn get_value(&self, handle: NodeId, path: &str) -> Result<String> {
        self.core.get_value(handle, path)
    }

    pub fn multi_get_value(&self, handle: NodeId, paths: Vec<String>) -> Result<Vec<String>> {
        self.core.multi_get_value(handle, paths)
    }

    pub fn set_value(&self, handle: NodeId, path: &str, value: &str) -> Result<()> {
        self.core.set_value(handle, path, value)
    }

    pub fn multi_set_value(
        &self,
        handle: NodeId,
        paths: Vec<String>,
        values: Vec<String>,
    ) -> Result<()> {
        self.core.multi_set_value(handle, paths, values)
    }

    /// Send a device command; the reply flag fans acquisition side effects
    /// out to every hardware endpoint.
    pub fn send_command(&self, handle: NodeId, path: &str) -> Result<()> {
        let reply = self.core.send_command(handle, path)?;
        match reply.flag {
            ReplyFlag::Arm => {
                for hw in &self.hw_endpoints {
                    hw.arm_acquisition()?;
                }
            }
            ReplyFlag::Disarm => {
                for hw in &self.hw_endpoints {
                    hw.disarm_acquisition()?;
                }
            }
            ReplyFlag::Clear | ReplyFlag::Reset => {
                for hw in &self.hw_endpoints {
                    hw.clear_data()?;
                }
            }
            ReplyFlag::Unknown => {}
        }
        Ok(())
    }

    pub fn get_user_register(&self, handle: NodeId, address: u32) -> Result<u32> {
        if handle != self.core.digitizer {
            return Err(Error::InvalidArgument(
                "get_user_register must be invoked on the digitizer handle".into(),
            ));
        }
        self.core
            .get_value_with_arg(handle, USER_REGISTER_PATH, &address.to_string())?
            .parse()
            .map_err(|_| Error::Communication("invalid register value".into()))
    }

    pub fn set_user_register(&self, handle: NodeId, address: u32, value: u32) -> Result<()> {
        if handle != self.core.digitizer {
            return Err(Error::InvalidArgument(
                "set_user_register must be invoked on the digitizer handle".into(),
            ));
        }
        self.core
            .set_value(handle, USER_REGISTER_PATH, &format!("{address}={value}"))
    }

    // Endpoint API.

    pub fn set_data_format(&self, handle: NodeId, json: &str) -> Result<()> {
        self.find_endpoint(handle, "set_data_format")?.set_data_format(json)
    }

    pub fn read_data(
        &self,
        handle: NodeId,
        timeout: Option<Duration>,
        slots: &mut [Slot<'_>],
    ) -> Result<()> {
        self.find_endpoint(handle, "read_data")?.read_data(timeout, slots)
    }

    pub fn has_data(&self, handle: NodeId, timeout: Option<Duration>) -> Result<()> {
        self.find_endpoint(handle, "has_data")?.has_data(timeout)
    }

    pub fn clear_data(&self, handle: NodeId) -> Result<()> {
        self.find_endpoint(handle, "clear_data")?.clear_data()
    }

    // Session accessors.

    pub fn digitizer(&self) -> NodeId {
        self.core.digitizer
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor
    }

    pub fn server_version_aligned(&self) -> bool {
        self.server_version_aligned
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn endpoint_address(&self) -> IpAddr {
        self.endpoint_address
    }

    pub fn n_channels(&self) -> usize {
        self.core.n_channels
    }

    pub fn sampling_period_ns(&self) -> f64 {
        self.core.sampling_period_ns
    }
}

fn install_getters(endpoint: &dyn HwEndpoint, core: &Arc<ControlCore>, own_name: &'static str) {
    let max_core = Arc::clone(core);
    endpoint.set_max_size_getter(Box::new(move || {
        max_core
            .get_value(max_core.digitizer, "/par/maxrawdatasize")?
            .parse()
            .map_err(|_| Error::Communication("invalid max raw data size".into()))
    }));
    let decoded_core = Arc::clone(core);
    endpoint.set_is_decoded_getter(Box::new(move || {
        Ok(decoded_core.active_endpoint()? != own_name)
    }));
}

/// On Linux the RNDIS network (`fda7:cae0::/32`) may hide a faster CDC
/// interface on the sibling `fda6` network; prefer it when the device
/// reports one.
fn compute_endpoint_address(core: &Arc<ControlCore>, address: IpAddr) -> IpAddr {
    if !cfg!(target_os = "linux") {
        return address;
    }
    let IpAddr::V6(v6) = address else {
        return address;
    };
    let octets = v6.octets();
    if octets[..4] != [0xfd, 0xa7, 0xca, 0xe0] {
        return address;
    }
    let has_cdc = core
        .value("/par/hascdc")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !has_cdc {
        return address;
    }
    let mut octets = octets;
    octets[1] = 0xa6;
    IpAddr::V6(Ipv6Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use serde_json::json;

    use super::*;

    /// A fake control server answering from a lookup table.
    fn spawn_control_server(
        version: Option<u32>,
    ) -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                let mut header = [0u8; 8];
                if stream.read_exact(&mut header).is_err() {
                    return;
                }
                let mut body = vec![0u8; u64::from_le_bytes(header) as usize];
                stream.read_exact(&mut body).unwrap();
                let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
                let cmd = request["cmd"].as_str().unwrap().to_owned();
                let query = request["query"].as_str().unwrap_or("").to_owned();

                let reply = match (cmd.as_str(), query.as_str()) {
                    ("connect", _) => {
                        let mut values = vec!["1".to_owned()];
                        if let Some(version) = version {
                            values.push(version.to_string());
                        }
                        json!({"cmd": "connect", "result": true, "value": values})
                    }
                    ("getValue", "/par/numch") => {
                        json!({"cmd": "getValue", "result": true, "value": ["64"]})
                    }
                    ("getValue", "/par/adc_samplrate") => {
                        json!({"cmd": "getValue", "result": true, "value": ["125"]})
                    }
                    ("getPath", _) => {
                        json!({"cmd": "getPath", "result": true, "value": ["/"]})
                    }
                    ("getValue", _) => {
                        json!({"cmd": "getValue", "result": false, "value": ["no such node"]})
                    }
                    ("sendCommand", "/cmd/armacquisition") => {
                        json!({"cmd": "sendCommand", "result": true, "flag": "ARM", "value": []})
                    }
                    _ => json!({"cmd": cmd, "result": true, "value": []}),
                };
                let body = serde_json::to_vec(&reply).unwrap();
                stream
                    .write_all(&(body.len() as u64).to_le_bytes())
                    .unwrap();
                stream.write_all(&body).unwrap();
            }
        });
        (addr, handle)
    }

    fn monitor_url_data() -> UrlData {
        let mut data = UrlData::default();
        data.monitor = true;
        data
    }

    #[test]
    fn test_monitor_session_connects() {
        let (addr, _server) = spawn_control_server(Some(10601));
        let client = Client::open_at(addr, monitor_url_data()).unwrap();
        assert!(client.is_monitor());
        assert!(client.server_version_aligned());
        assert_eq!(client.digitizer(), 1);
        assert_eq!(client.n_channels(), 64);
        assert_eq!(client.sampling_period_ns(), 8.0);
        assert_eq!(client.get_path(client.digitizer()).unwrap(), "/");
    }

    #[test]
    fn test_newer_server_version_flagged() {
        // Major.minor 2.0 is ahead of this library.
        let (addr, _server) = spawn_control_server(Some(20000));
        let client = Client::open_at(addr, monitor_url_data()).unwrap();
        assert!(!client.server_version_aligned());
    }

    #[test]
    fn test_command_error_propagates() {
        let (addr, _server) = spawn_control_server(Some(10601));
        let client = Client::open_at(addr, monitor_url_data()).unwrap();
        let err = client
            .get_value(client.digitizer(), "/par/nonexistent")
            .unwrap_err();
        assert!(matches!(err, Error::Command(_)));
    }

    #[test]
    fn test_monitor_session_has_no_endpoints() {
        let (addr, _server) = spawn_control_server(Some(10601));
        let client = Client::open_at(addr, monitor_url_data()).unwrap();
        let err = client
            .read_data(42, Some(Duration::ZERO), &mut [])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_user_register_on_wrong_handle_rejected() {
        let (addr, _server) = spawn_control_server(Some(10601));
        let client = Client::open_at(addr, monitor_url_data()).unwrap();
        assert!(client.get_user_register(99, 0).is_err());
    }
}
