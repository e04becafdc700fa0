use std::collections::HashMap;

use crate::utils::roundup2;

pub const REGISTER_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    SInt16,
    UInt16,
    SInt32,
    UInt32,
    SInt64,
    UInt64,
    Half,
    Float,
    Double,
}
impl ScalarType {
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::SInt16 | Self::UInt16 | Self::Half => 16,
            Self::SInt32 | Self::UInt32 | Self::Float => 32,
            Self::SInt64 | Self::UInt64 | Self::Double => 64,
        }
    }

    /// In-memory footprint. Bools never hit memory in their 1-bit form, they
    /// round-trip as 32-bit integers.
    pub const fn byte_size(self) -> u32 {
        match self {
            Self::Bool => 4,
            Self::SInt16 | Self::UInt16 | Self::Half => 2,
            Self::SInt32 | Self::UInt32 | Self::Float => 4,
            Self::SInt64 | Self::UInt64 | Self::Double => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Half | Self::Float | Self::Double)
    }

    pub const fn is_signed_int(self) -> bool {
        matches!(self, Self::SInt16 | Self::SInt32 | Self::SInt64)
    }

    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::SInt64 | Self::UInt64 | Self::Double)
    }

    pub const fn is_16bit(self) -> bool {
        matches!(self, Self::SInt16 | Self::UInt16 | Self::Half)
    }

    /// The same-width integer representation, used by the atomic paths and
    /// the bool memory round-trip.
    pub const fn as_int_of_same_width(self) -> Self {
        match self {
            Self::Bool => Self::UInt32,
            Self::Half => Self::UInt16,
            Self::Float => Self::UInt32,
            Self::Double => Self::UInt64,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrSpace {
    Default,
    GroupShared,
    NodeRecord,
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(pub u32);
impl core::fmt::Debug for TypeRef {
    #[inline(always)]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructRef(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeData {
    Void,
    Scalar(ScalarType),
    Vector(ScalarType, u8),
    Matrix {
        elem: ScalarType,
        rows: u8,
        cols: u8,
        row_major: bool,
    },
    Array {
        elem: TypeRef,
        len: u32,
    },
    Struct(StructRef),
    Ptr {
        pointee: TypeRef,
        addr_space: AddrSpace,
    },
    Handle,
}

#[derive(Debug, Clone)]
pub struct StructField<'s> {
    pub name: &'s str,
    pub ty: TypeRef,
}

/// Per-field byte offsets under both layout regimes. Computed once when the
/// struct is defined; read-only to the lowering pass.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub linear_offset: u32,
    pub legacy_offset: u32,
}

#[derive(Debug, Clone)]
pub struct StructLayout {
    pub fields: Vec<FieldLayout>,
    pub linear_size: u32,
    pub linear_align: u32,
    /// Register-rounded total, in bytes.
    pub legacy_size: u32,
}

#[derive(Debug)]
pub struct StructDef<'s> {
    pub name: &'s str,
    pub fields: Vec<StructField<'s>>,
    pub layout: StructLayout,
}

/// Interning context for types, following the request/memo discipline of the
/// backend emission context. `TypeRef`s are stable for the lifetime of the
/// module.
pub struct TypeContext<'s> {
    types: Vec<TypeData>,
    defined_type_map: HashMap<TypeData, TypeRef>,
    structs: Vec<StructDef<'s>>,
    /// When false, 16-bit scalars are stored as min-precision 32-bit slots in
    /// the legacy register layout (4 channels per register instead of 8).
    pub native_16bit: bool,
}
impl<'s> TypeContext<'s> {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            defined_type_map: HashMap::new(),
            structs: Vec::new(),
            native_16bit: true,
        }
    }

    pub fn request_type(&mut self, t: TypeData) -> TypeRef {
        if let Some(&id) = self.defined_type_map.get(&t) {
            return id;
        }

        let id = TypeRef(self.types.len() as u32);
        self.types.push(t.clone());
        self.defined_type_map.insert(t, id);
        id
    }

    #[inline]
    pub fn data(&self, t: TypeRef) -> &TypeData {
        &self.types[t.0 as usize]
    }

    #[inline]
    pub fn struct_def(&self, s: StructRef) -> &StructDef<'s> {
        &self.structs[s.0 as usize]
    }

    #[inline]
    pub fn void(&mut self) -> TypeRef {
        self.request_type(TypeData::Void)
    }

    #[inline]
    pub fn scalar(&mut self, s: ScalarType) -> TypeRef {
        self.request_type(TypeData::Scalar(s))
    }

    #[inline]
    pub fn vector(&mut self, s: ScalarType, width: u8) -> TypeRef {
        if width == 1 {
            self.scalar(s)
        } else {
            self.request_type(TypeData::Vector(s, width))
        }
    }

    #[inline]
    pub fn matrix(&mut self, elem: ScalarType, rows: u8, cols: u8, row_major: bool) -> TypeRef {
        self.request_type(TypeData::Matrix {
            elem,
            rows,
            cols,
            row_major,
        })
    }

    #[inline]
    pub fn array(&mut self, elem: TypeRef, len: u32) -> TypeRef {
        self.request_type(TypeData::Array { elem, len })
    }

    #[inline]
    pub fn ptr(&mut self, pointee: TypeRef, addr_space: AddrSpace) -> TypeRef {
        self.request_type(TypeData::Ptr {
            pointee,
            addr_space,
        })
    }

    #[inline]
    pub fn handle(&mut self) -> TypeRef {
        self.request_type(TypeData::Handle)
    }

    pub fn define_struct(&mut self, name: &'s str, fields: Vec<StructField<'s>>) -> TypeRef {
        let layout = self.annotate_struct_layout(&fields);
        let sref = StructRef(self.structs.len() as u32);
        self.structs.push(StructDef {
            name,
            fields,
            layout,
        });
        self.request_type(TypeData::Struct(sref))
    }

    /// Channel width in the legacy register layout for one scalar slot.
    pub fn legacy_channel_size(&self, s: ScalarType) -> u32 {
        if s.is_16bit() && !self.native_16bit {
            4
        } else {
            s.byte_size().max(2)
        }
    }

    /// Byte size of a type under the legacy 16-byte-register layout.
    /// Aggregates are always rounded up to a whole register.
    pub fn legacy_size(&self, t: TypeRef) -> u32 {
        match *self.data(t) {
            TypeData::Void => 0,
            TypeData::Scalar(s) => self.legacy_channel_size(s),
            TypeData::Vector(s, w) => self.legacy_channel_size(s) * w as u32,
            TypeData::Matrix {
                rows,
                cols,
                row_major,
                ..
            } => {
                // one register per row (row-major) or per column (col-major)
                let majors = if row_major { rows as u32 } else { cols as u32 };
                majors * REGISTER_SIZE
            }
            TypeData::Array { elem, len } => {
                roundup2(self.legacy_size(elem), REGISTER_SIZE) * len
            }
            TypeData::Struct(s) => self.struct_def(s).layout.legacy_size,
            TypeData::Ptr { .. } | TypeData::Handle => 0,
        }
    }

    /// Byte size under the packed linear layout.
    pub fn linear_size(&self, t: TypeRef) -> u32 {
        match *self.data(t) {
            TypeData::Void => 0,
            TypeData::Scalar(s) => s.byte_size(),
            TypeData::Vector(s, w) => s.byte_size() * w as u32,
            TypeData::Matrix {
                elem, rows, cols, ..
            } => elem.byte_size() * rows as u32 * cols as u32,
            TypeData::Array { elem, len } => self.linear_stride(elem) * len,
            TypeData::Struct(s) => self.struct_def(s).layout.linear_size,
            TypeData::Ptr { .. } | TypeData::Handle => 0,
        }
    }

    pub fn linear_align(&self, t: TypeRef) -> u32 {
        match *self.data(t) {
            TypeData::Void => 1,
            TypeData::Scalar(s) | TypeData::Vector(s, _) => s.byte_size(),
            TypeData::Matrix { elem, .. } => elem.byte_size(),
            TypeData::Array { elem, .. } => self.linear_align(elem),
            TypeData::Struct(s) => self.struct_def(s).layout.linear_align,
            TypeData::Ptr { .. } | TypeData::Handle => 1,
        }
    }

    #[inline]
    pub fn linear_stride(&self, t: TypeRef) -> u32 {
        roundup2(self.linear_size(t), self.linear_align(t))
    }

    /// Array element stride in the legacy layout: every element starts at a
    /// fresh register.
    #[inline]
    pub fn legacy_stride(&self, t: TypeRef) -> u32 {
        roundup2(self.legacy_size(t), REGISTER_SIZE)
    }

    fn annotate_struct_layout(&self, fields: &[StructField<'s>]) -> StructLayout {
        let mut out = Vec::with_capacity(fields.len());
        let mut linear = 0u32;
        let mut linear_align = 1u32;
        let mut legacy = 0u32;

        for f in fields {
            let a = self.linear_align(f.ty);
            linear = roundup2(linear, a);
            linear_align = linear_align.max(a);
            let linear_offset = linear;
            linear += self.linear_size(f.ty);

            let legacy_offset = match *self.data(f.ty) {
                TypeData::Scalar(s) => {
                    let ch = self.legacy_channel_size(s);
                    place_legacy_slot(&mut legacy, ch, ch)
                }
                TypeData::Vector(s, w) => {
                    let ch = self.legacy_channel_size(s);
                    place_legacy_slot(&mut legacy, ch, ch * w as u32)
                }
                // aggregates always realign to the next register
                _ => {
                    legacy = roundup2(legacy, REGISTER_SIZE);
                    let o = legacy;
                    legacy += self.legacy_size(f.ty);
                    legacy = roundup2(legacy, REGISTER_SIZE);
                    o
                }
            };

            out.push(FieldLayout {
                linear_offset,
                legacy_offset,
            });
        }

        StructLayout {
            fields: out,
            linear_size: roundup2(linear, linear_align),
            linear_align,
            legacy_size: roundup2(legacy, REGISTER_SIZE),
        }
    }

    /// Scalar element of a scalar/vector/matrix type.
    pub fn scalar_of(&self, t: TypeRef) -> Option<ScalarType> {
        match *self.data(t) {
            TypeData::Scalar(s) | TypeData::Vector(s, _) => Some(s),
            TypeData::Matrix { elem, .. } => Some(elem),
            _ => None,
        }
    }

    /// Lane count: 1 for scalars, the width for vectors, None otherwise.
    pub fn vector_width(&self, t: TypeRef) -> Option<u32> {
        match *self.data(t) {
            TypeData::Scalar(_) => Some(1),
            TypeData::Vector(_, w) => Some(w as u32),
            _ => None,
        }
    }

    pub fn is_aggregate(&self, t: TypeRef) -> bool {
        matches!(
            self.data(t),
            TypeData::Array { .. } | TypeData::Struct(_) | TypeData::Matrix { .. }
        )
    }
}

/// Places one scalar/vector slot in the running legacy offset: align to the
/// channel size, and never let the slot span a register boundary.
fn place_legacy_slot(cursor: &mut u32, chan: u32, size: u32) -> u32 {
    let mut o = roundup2(*cursor, chan);
    if o % REGISTER_SIZE + size > REGISTER_SIZE {
        o = roundup2(o, REGISTER_SIZE);
    }
    *cursor = o + size;
    o
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_slots_do_not_span_registers() {
        let mut c = TypeContext::new();
        let f3 = c.vector(ScalarType::Float, 3);
        let f2 = c.vector(ScalarType::Float, 2);
        let f1 = c.scalar(ScalarType::Float);
        let st = c.define_struct(
            "S",
            vec![
                StructField { name: "a", ty: f3 },
                StructField { name: "b", ty: f2 },
                StructField { name: "c", ty: f1 },
            ],
        );
        let TypeData::Struct(sr) = *c.data(st) else {
            unreachable!()
        };
        let l = &c.struct_def(sr).layout;
        assert_eq!(l.fields[0].legacy_offset, 0);
        // float2 after float3 would span xyz|w boundary, so it starts a new register
        assert_eq!(l.fields[1].legacy_offset, 16);
        // the trailing float still fits in register 1
        assert_eq!(l.fields[2].legacy_offset, 24);
        assert_eq!(l.legacy_size, 32);
    }

    #[test]
    fn linear_layout_is_packed() {
        let mut c = TypeContext::new();
        let f3 = c.vector(ScalarType::Float, 3);
        let f1 = c.scalar(ScalarType::Float);
        let st = c.define_struct(
            "S",
            vec![
                StructField { name: "a", ty: f3 },
                StructField { name: "b", ty: f1 },
            ],
        );
        assert_eq!(c.linear_size(st), 16);
        let TypeData::Struct(sr) = *c.data(st) else {
            unreachable!()
        };
        assert_eq!(c.struct_def(sr).layout.fields[1].linear_offset, 12);
    }

    #[test]
    fn array_of_struct_strides_by_whole_registers() {
        let mut c = TypeContext::new();
        let f1 = c.scalar(ScalarType::Float);
        let st = c.define_struct("S", vec![StructField { name: "x", ty: f1 }]);
        let arr = c.array(st, 4);
        assert_eq!(c.legacy_size(arr), 64);
        assert_eq!(c.linear_size(arr), 16);
    }

    #[test]
    fn half_channels_depend_on_packing_mode() {
        let mut c = TypeContext::new();
        assert_eq!(c.legacy_channel_size(ScalarType::Half), 2);
        c.native_16bit = false;
        assert_eq!(c.legacy_channel_size(ScalarType::Half), 4);
    }
}
