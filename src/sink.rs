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

//! Projection of decoded records into consumer-supplied buffers.
//!
//! `read_data` walks the active schema; for every entry it writes the
//! corresponding record field into the next caller slot. The slot's type must
//! be the schema's wire type (the schema, not the record, decides what the
//! consumer gets). Conversions widen losslessly; narrowing across different
//! widths is range-checked; integer conversions at equal width reinterpret
//! the bits, which is also the byte-exact fast path for waveform copies.

use std::mem;

use crate::format::FormatField;
use crate::format::Schema;
use crate::format::SchemaEntry;
use crate::format::WireType;
use crate::prelude::*;

/// A decoded scalar on its way to a consumer slot.
#[derive(Debug, Clone, Copy)]
pub enum Scalar {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
}

macro_rules! scalar_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Scalar::U64(v as u64)
            }
        }
    )*};
}
macro_rules! scalar_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Scalar::I64(v as i64)
            }
        }
    )*};
}
scalar_from_unsigned!(u8, u16, u32, u64, usize);
scalar_from_signed!(i8, i16, i32, i64, isize);

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

fn range_error() -> Error {
    Error::InvalidArgument("value out of range for target type".into())
}

/// Element type usable in array/matrix slots: the arithmetic subset.
pub trait Elem: Copy + bytemuck::Pod + 'static {
    const IS_INT: bool;
    fn to_scalar(self) -> Scalar;
    fn from_scalar(scalar: Scalar) -> Result<Self>;
}

macro_rules! unsigned_elem {
    ($($t:ty),*) => {$(
        impl Elem for $t {
            const IS_INT: bool = true;
            fn to_scalar(self) -> Scalar {
                Scalar::U64(self as u64)
            }
            fn from_scalar(scalar: Scalar) -> Result<Self> {
                match scalar {
                    Scalar::U64(v) => <$t>::try_from(v).map_err(|_| range_error()),
                    Scalar::I64(v) => u64::try_from(v)
                        .ok()
                        .and_then(|v| <$t>::try_from(v).ok())
                        .ok_or_else(range_error),
                    Scalar::Bool(v) => Ok(v as $t),
                    Scalar::F64(_) => Err(range_error()),
                }
            }
        }
    )*};
}
macro_rules! signed_elem {
    ($($t:ty),*) => {$(
        impl Elem for $t {
            const IS_INT: bool = true;
            fn to_scalar(self) -> Scalar {
                Scalar::I64(self as i64)
            }
            fn from_scalar(scalar: Scalar) -> Result<Self> {
                match scalar {
                    Scalar::U64(v) => i64::try_from(v)
                        .ok()
                        .and_then(|v| <$t>::try_from(v).ok())
                        .ok_or_else(range_error),
                    Scalar::I64(v) => <$t>::try_from(v).map_err(|_| range_error()),
                    Scalar::Bool(v) => Ok(v as $t),
                    Scalar::F64(_) => Err(range_error()),
                }
            }
        }
    )*};
}
macro_rules! float_elem {
    ($($t:ty),*) => {$(
        impl Elem for $t {
            const IS_INT: bool = false;
            fn to_scalar(self) -> Scalar {
                Scalar::F64(self as f64)
            }
            fn from_scalar(scalar: Scalar) -> Result<Self> {
                match scalar {
                    Scalar::U64(v) => Ok(v as $t),
                    Scalar::I64(v) => Ok(v as $t),
                    Scalar::F64(v) => Ok(v as $t),
                    Scalar::Bool(v) => Ok(v as u8 as $t),
                }
            }
        }
    )*};
}
unsigned_elem!(u8, u16, u32, u64, usize);
signed_elem!(i8, i16, i32, i64, isize);
float_elem!(f32, f64);

/// A borrowed view of a decoded array field.
#[derive(Debug, Clone, Copy)]
pub enum ArraySrc<'a> {
    U8(&'a [u8]),
    U16(&'a [u16]),
    U32(&'a [u32]),
    U64(&'a [u64]),
    I32(&'a [i32]),
    Usize(&'a [usize]),
    F64(&'a [f64]),
    Bool(&'a [bool]),
}

macro_rules! array_src_from {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl<'a> From<&'a [$t]> for ArraySrc<'a> {
            fn from(slice: &'a [$t]) -> Self {
                ArraySrc::$variant(slice)
            }
        }
        impl<'a> From<&'a Vec<$t>> for ArraySrc<'a> {
            fn from(vec: &'a Vec<$t>) -> Self {
                ArraySrc::$variant(vec)
            }
        }
    )*};
}
array_src_from!(
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i32 => I32,
    usize => Usize,
    f64 => F64,
    bool => Bool,
);

macro_rules! slot_enum {
    ($name:ident, $($variant:ident => $t:ty : $wire:ident),* $(,)?) => {
        #[derive(Debug)]
        pub enum $name<'a> {
            $($variant(&'a mut $t),)*
        }

        impl $name<'_> {
            pub fn ty(&self) -> WireType {
                match self {
                    $(Self::$variant(_) => WireType::$wire,)*
                }
            }
        }
    };
}

slot_enum!(ScalarSlot,
    U8 => u8 : U8,
    U16 => u16 : U16,
    U32 => u32 : U32,
    U64 => u64 : U64,
    I8 => i8 : I8,
    I16 => i16 : I16,
    I32 => i32 : I32,
    I64 => i64 : I64,
    Char => u8 : Char,
    Bool => bool : Bool,
    Size => usize : SizeT,
    Ptrdiff => isize : PtrdiffT,
    F32 => f32 : Float,
    F64 => f64 : Double,
);

slot_enum!(ArraySlot,
    U8 => Vec<u8> : U8,
    U16 => Vec<u16> : U16,
    U32 => Vec<u32> : U32,
    U64 => Vec<u64> : U64,
    I8 => Vec<i8> : I8,
    I16 => Vec<i16> : I16,
    I32 => Vec<i32> : I32,
    I64 => Vec<i64> : I64,
    Size => Vec<usize> : SizeT,
    Ptrdiff => Vec<isize> : PtrdiffT,
    F32 => Vec<f32> : Float,
    F64 => Vec<f64> : Double,
);

slot_enum!(MatrixSlot,
    U8 => Vec<Vec<u8>> : U8,
    U16 => Vec<Vec<u16>> : U16,
    U32 => Vec<Vec<u32>> : U32,
    U64 => Vec<Vec<u64>> : U64,
    I8 => Vec<Vec<i8>> : I8,
    I16 => Vec<Vec<i16>> : I16,
    I32 => Vec<Vec<i32>> : I32,
    I64 => Vec<Vec<i64>> : I64,
    Size => Vec<Vec<usize>> : SizeT,
    Ptrdiff => Vec<Vec<isize>> : PtrdiffT,
    F32 => Vec<Vec<f32>> : Float,
    F64 => Vec<Vec<f64>> : Double,
);

/// One consumer-supplied output slot, the Rust rendering of one variadic
/// argument.
#[derive(Debug)]
pub enum Slot<'a> {
    Scalar(ScalarSlot<'a>),
    Array(ArraySlot<'a>),
    Matrix(MatrixSlot<'a>),
}

macro_rules! slot_ctors {
    ($($fn_name:ident($t:ty) => $outer:ident: $inner:ident / $variant:ident),* $(,)?) => {
        impl<'a> Slot<'a> {
            $(pub fn $fn_name(slot: &'a mut $t) -> Self {
                Slot::$outer($inner::$variant(slot))
            })*
        }
    };
}

slot_ctors!(
    u8(u8) => Scalar: ScalarSlot / U8,
    u16(u16) => Scalar: ScalarSlot / U16,
    u32(u32) => Scalar: ScalarSlot / U32,
    u64(u64) => Scalar: ScalarSlot / U64,
    i8(i8) => Scalar: ScalarSlot / I8,
    i16(i16) => Scalar: ScalarSlot / I16,
    i32(i32) => Scalar: ScalarSlot / I32,
    i64(i64) => Scalar: ScalarSlot / I64,
    ch(u8) => Scalar: ScalarSlot / Char,
    boolean(bool) => Scalar: ScalarSlot / Bool,
    size(usize) => Scalar: ScalarSlot / Size,
    ptrdiff(isize) => Scalar: ScalarSlot / Ptrdiff,
    f32(f32) => Scalar: ScalarSlot / F32,
    f64(f64) => Scalar: ScalarSlot / F64,
    arr_u8(Vec<u8>) => Array: ArraySlot / U8,
    arr_u16(Vec<u16>) => Array: ArraySlot / U16,
    arr_u32(Vec<u32>) => Array: ArraySlot / U32,
    arr_u64(Vec<u64>) => Array: ArraySlot / U64,
    arr_i8(Vec<i8>) => Array: ArraySlot / I8,
    arr_i16(Vec<i16>) => Array: ArraySlot / I16,
    arr_i32(Vec<i32>) => Array: ArraySlot / I32,
    arr_i64(Vec<i64>) => Array: ArraySlot / I64,
    arr_size(Vec<usize>) => Array: ArraySlot / Size,
    arr_ptrdiff(Vec<isize>) => Array: ArraySlot / Ptrdiff,
    arr_f32(Vec<f32>) => Array: ArraySlot / F32,
    arr_f64(Vec<f64>) => Array: ArraySlot / F64,
    mat_u8(Vec<Vec<u8>>) => Matrix: MatrixSlot / U8,
    mat_u16(Vec<Vec<u16>>) => Matrix: MatrixSlot / U16,
    mat_u32(Vec<Vec<u32>>) => Matrix: MatrixSlot / U32,
    mat_u64(Vec<Vec<u64>>) => Matrix: MatrixSlot / U64,
    mat_i8(Vec<Vec<i8>>) => Matrix: MatrixSlot / I8,
    mat_i16(Vec<Vec<i16>>) => Matrix: MatrixSlot / I16,
    mat_i32(Vec<Vec<i32>>) => Matrix: MatrixSlot / I32,
    mat_i64(Vec<Vec<i64>>) => Matrix: MatrixSlot / I64,
    mat_size(Vec<Vec<usize>>) => Matrix: MatrixSlot / Size,
    mat_ptrdiff(Vec<Vec<isize>>) => Matrix: MatrixSlot / Ptrdiff,
    mat_f32(Vec<Vec<f32>>) => Matrix: MatrixSlot / F32,
    mat_f64(Vec<Vec<f64>>) => Matrix: MatrixSlot / F64,
);

fn types_match(schema_ty: WireType, slot_ty: WireType) -> bool {
    // LONG DOUBLE is stored at f64 precision.
    let normalize = |ty| match ty {
        WireType::LongDouble => WireType::Double,
        other => other,
    };
    normalize(schema_ty) == normalize(slot_ty)
}

fn convert_slice<S: Elem, D: Elem>(src: &[S], dst: &mut Vec<D>) -> Result<()> {
    dst.clear();
    if S::IS_INT && D::IS_INT && mem::size_of::<S>() == mem::size_of::<D>() {
        // Byte-exact path: same width modulo signedness reinterprets.
        dst.extend_from_slice(bytemuck::cast_slice(src));
        return Ok(());
    }
    dst.reserve(src.len());
    for &value in src {
        dst.push(D::from_scalar(value.to_scalar())?);
    }
    Ok(())
}

fn fill_from<D: Elem>(dst: &mut Vec<D>, src: ArraySrc<'_>) -> Result<()> {
    match src {
        ArraySrc::U8(s) => convert_slice(s, dst),
        ArraySrc::U16(s) => convert_slice(s, dst),
        ArraySrc::U32(s) => convert_slice(s, dst),
        ArraySrc::U64(s) => convert_slice(s, dst),
        ArraySrc::I32(s) => convert_slice(s, dst),
        ArraySrc::Usize(s) => convert_slice(s, dst),
        ArraySrc::F64(s) => convert_slice(s, dst),
        ArraySrc::Bool(s) => {
            dst.clear();
            dst.reserve(s.len());
            for &value in s {
                dst.push(D::from_scalar(Scalar::Bool(value))?);
            }
            Ok(())
        }
    }
}

fn fill_array(slot: &mut ArraySlot<'_>, src: ArraySrc<'_>) -> Result<()> {
    match slot {
        ArraySlot::U8(dst) => fill_from(dst, src),
        ArraySlot::U16(dst) => fill_from(dst, src),
        ArraySlot::U32(dst) => fill_from(dst, src),
        ArraySlot::U64(dst) => fill_from(dst, src),
        ArraySlot::I8(dst) => fill_from(dst, src),
        ArraySlot::I16(dst) => fill_from(dst, src),
        ArraySlot::I32(dst) => fill_from(dst, src),
        ArraySlot::I64(dst) => fill_from(dst, src),
        ArraySlot::Size(dst) => fill_from(dst, src),
        ArraySlot::Ptrdiff(dst) => fill_from(dst, src),
        ArraySlot::F32(dst) => fill_from(dst, src),
        ArraySlot::F64(dst) => fill_from(dst, src),
    }
}

fn fill_array_iter(slot: &mut ArraySlot<'_>, values: impl Iterator<Item = Scalar>) -> Result<()> {
    fn fill<D: Elem>(dst: &mut Vec<D>, values: impl Iterator<Item = Scalar>) -> Result<()> {
        dst.clear();
        for value in values {
            dst.push(D::from_scalar(value)?);
        }
        Ok(())
    }
    match slot {
        ArraySlot::U8(dst) => fill(dst, values),
        ArraySlot::U16(dst) => fill(dst, values),
        ArraySlot::U32(dst) => fill(dst, values),
        ArraySlot::U64(dst) => fill(dst, values),
        ArraySlot::I8(dst) => fill(dst, values),
        ArraySlot::I16(dst) => fill(dst, values),
        ArraySlot::I32(dst) => fill(dst, values),
        ArraySlot::I64(dst) => fill(dst, values),
        ArraySlot::Size(dst) => fill(dst, values),
        ArraySlot::Ptrdiff(dst) => fill(dst, values),
        ArraySlot::F32(dst) => fill(dst, values),
        ArraySlot::F64(dst) => fill(dst, values),
    }
}

fn fill_matrix<'s>(
    slot: &mut MatrixSlot<'_>,
    rows: impl Iterator<Item = ArraySrc<'s>>,
) -> Result<()> {
    fn fill<'s, D: Elem>(
        dst: &mut Vec<Vec<D>>,
        rows: impl Iterator<Item = ArraySrc<'s>>,
    ) -> Result<()> {
        let mut count = 0;
        for row in rows {
            if dst.len() <= count {
                dst.push(Vec::new());
            }
            fill_from(&mut dst[count], row)?;
            count += 1;
        }
        dst.truncate(count);
        Ok(())
    }
    match slot {
        MatrixSlot::U8(dst) => fill(dst, rows),
        MatrixSlot::U16(dst) => fill(dst, rows),
        MatrixSlot::U32(dst) => fill(dst, rows),
        MatrixSlot::U64(dst) => fill(dst, rows),
        MatrixSlot::I8(dst) => fill(dst, rows),
        MatrixSlot::I16(dst) => fill(dst, rows),
        MatrixSlot::I32(dst) => fill(dst, rows),
        MatrixSlot::I64(dst) => fill(dst, rows),
        MatrixSlot::Size(dst) => fill(dst, rows),
        MatrixSlot::Ptrdiff(dst) => fill(dst, rows),
        MatrixSlot::F32(dst) => fill(dst, rows),
        MatrixSlot::F64(dst) => fill(dst, rows),
    }
}

fn write_scalar(slot: &mut ScalarSlot<'_>, value: Scalar) -> Result<()> {
    match slot {
        ScalarSlot::U8(dst) => **dst = u8::from_scalar(value)?,
        ScalarSlot::U16(dst) => **dst = u16::from_scalar(value)?,
        ScalarSlot::U32(dst) => **dst = u32::from_scalar(value)?,
        ScalarSlot::U64(dst) => **dst = u64::from_scalar(value)?,
        ScalarSlot::I8(dst) => **dst = i8::from_scalar(value)?,
        ScalarSlot::I16(dst) => **dst = i16::from_scalar(value)?,
        ScalarSlot::I32(dst) => **dst = i32::from_scalar(value)?,
        ScalarSlot::I64(dst) => **dst = i64::from_scalar(value)?,
        ScalarSlot::Char(dst) => **dst = u8::from_scalar(value)?,
        ScalarSlot::Size(dst) => **dst = usize::from_scalar(value)?,
        ScalarSlot::Ptrdiff(dst) => **dst = isize::from_scalar(value)?,
        ScalarSlot::F32(dst) => **dst = f32::from_scalar(value)?,
        ScalarSlot::F64(dst) => **dst = f64::from_scalar(value)?,
        ScalarSlot::Bool(dst) => {
            **dst = match value {
                Scalar::Bool(v) => v,
                Scalar::U64(v) => v != 0,
                Scalar::I64(v) => v != 0,
                Scalar::F64(_) => return Err(range_error()),
            }
        }
    }
    Ok(())
}

/// Schema-driven writer over the caller's slots.
///
/// The owning decoder walks its fields with [`Projector::next_field`] and
/// hands each one over with the matching `put_*` call; the projector enforces
/// slot count, slot rank and slot type against the schema.
pub struct Projector<'s, 'b, F> {
    entries: &'s [SchemaEntry<F>],
    slots: &'s mut [Slot<'b>],
    index: usize,
}

impl<'s, 'b, F: FormatField> Projector<'s, 'b, F> {
    pub fn new(schema: &'s Schema<F>, slots: &'s mut [Slot<'b>]) -> Result<Self> {
        let entries = schema.entries();
        if entries.len() != slots.len() {
            return Err(Error::InvalidArgument(format!(
                "format selects {} fields but {} output slots were supplied",
                entries.len(),
                slots.len()
            )));
        }
        Ok(Self {
            entries,
            slots,
            index: 0,
        })
    }

    /// The field the next `put_*` call must provide, or `None` when every
    /// schema entry has been projected.
    pub fn next_field(&self) -> Option<F> {
        self.entries.get(self.index).map(|entry| entry.field)
    }

    fn advance(&mut self) -> (SchemaEntry<F>, &mut Slot<'b>) {
        let entry = self.entries[self.index];
        let slot = &mut self.slots[self.index];
        self.index += 1;
        (entry, slot)
    }

    fn mismatch(entry: &SchemaEntry<F>, slot_ty: Option<WireType>) -> Error {
        match slot_ty {
            Some(ty) => Error::InvalidArgument(format!(
                "slot type {ty:?} does not match schema type {:?} for {}",
                entry.ty,
                entry.field.name()
            )),
            None => Error::InvalidArgument(format!(
                "slot rank does not match schema rank {} for {}",
                entry.rank,
                entry.field.name()
            )),
        }
    }

    pub fn put_scalar(&mut self, value: impl Into<Scalar>) -> Result<()> {
        let (entry, slot) = self.advance();
        let Slot::Scalar(target) = slot else {
            return Err(Self::mismatch(&entry, None));
        };
        if !types_match(entry.ty, target.ty()) {
            return Err(Self::mismatch(&entry, Some(target.ty())));
        }
        write_scalar(target, value.into())
    }

    pub fn put_array(&mut self, src: ArraySrc<'_>) -> Result<()> {
        let (entry, slot) = self.advance();
        let Slot::Array(target) = slot else {
            return Err(Self::mismatch(&entry, None));
        };
        if !types_match(entry.ty, target.ty()) {
            return Err(Self::mismatch(&entry, Some(target.ty())));
        }
        fill_array(target, src)
    }

    pub fn put_array_iter(&mut self, values: impl Iterator<Item = Scalar>) -> Result<()> {
        let (entry, slot) = self.advance();
        let Slot::Array(target) = slot else {
            return Err(Self::mismatch(&entry, None));
        };
        if !types_match(entry.ty, target.ty()) {
            return Err(Self::mismatch(&entry, Some(target.ty())));
        }
        fill_array_iter(target, values)
    }

    pub fn put_matrix<'x>(&mut self, rows: impl Iterator<Item = ArraySrc<'x>>) -> Result<()> {
        let (entry, slot) = self.advance();
        let Slot::Matrix(target) = slot else {
            return Err(Self::mismatch(&entry, None));
        };
        if !types_match(entry.ty, target.ty()) {
            return Err(Self::mismatch(&entry, Some(target.ty())));
        }
        fill_matrix(target, rows)
    }
}
