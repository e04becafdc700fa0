//! Resource metadata resolution: recovering {class, kind, element type} for
//! any handle value by walking its wrapper chain, with memoized results and
//! the counter-bit write path.

use std::collections::{HashMap, HashSet};

use crate::concrete_type::TypeRef;
use crate::diag::{Diag, DiagSink, InvariantViolation};
use crate::hlop::HlOp;
use crate::ir::{CastOp, GlobalId, Instr, Module, ValueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Srv = 0,
    Uav = 1,
    CBuffer = 2,
    Sampler = 3,
    Invalid = 0xff,
}
impl ResourceClass {
    fn from_u32(x: u32) -> Self {
        match x {
            0 => Self::Srv,
            1 => Self::Uav,
            2 => Self::CBuffer,
            3 => Self::Sampler,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    TypedBuffer = 0,
    RawBuffer = 1,
    StructuredBuffer = 2,
    Texture1D = 3,
    Texture2D = 4,
    Texture3D = 5,
    TextureCube = 6,
    Texture1DArray = 7,
    Texture2DArray = 8,
    TextureCubeArray = 9,
    CBuffer = 10,
    Sampler = 11,
    Invalid = 0xff,
}
impl ResourceKind {
    fn from_u32(x: u32) -> Self {
        match x {
            0 => Self::TypedBuffer,
            1 => Self::RawBuffer,
            2 => Self::StructuredBuffer,
            3 => Self::Texture1D,
            4 => Self::Texture2D,
            5 => Self::Texture3D,
            6 => Self::TextureCube,
            7 => Self::Texture1DArray,
            8 => Self::Texture2DArray,
            9 => Self::TextureCubeArray,
            10 => Self::CBuffer,
            11 => Self::Sampler,
            _ => Self::Invalid,
        }
    }

    pub const fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::TypedBuffer | Self::RawBuffer | Self::StructuredBuffer
        )
    }

    pub const fn is_texture(self) -> bool {
        matches!(
            self,
            Self::Texture1D
                | Self::Texture2D
                | Self::Texture3D
                | Self::TextureCube
                | Self::Texture1DArray
                | Self::Texture2DArray
                | Self::TextureCubeArray
        )
    }

    /// Number of coordinate components for texture addressing.
    pub const fn coord_dims(self) -> u32 {
        match self {
            Self::Texture1D => 1,
            Self::Texture2D | Self::Texture1DArray => 2,
            Self::Texture3D | Self::TextureCube | Self::Texture2DArray => 3,
            Self::TextureCubeArray => 4,
            _ => 0,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceFlags: u16 {
        const HAS_COUNTER = 0b0001;
        const GLOBALLY_COHERENT = 0b0010;
        const RASTERIZER_ORDERED = 0b0100;
    }
}

/// The resolved descriptor for a handle. `elem` is the declared element type
/// for buffers/textures, or the layout struct for constant buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceProps {
    pub class: ResourceClass,
    pub kind: ResourceKind,
    pub elem: TypeRef,
    pub flags: ResourceFlags,
}
impl ResourceProps {
    pub const fn invalid() -> Self {
        Self {
            class: ResourceClass::Invalid,
            kind: ResourceKind::Invalid,
            elem: TypeRef(u32::MAX),
            flags: ResourceFlags::empty(),
        }
    }

    pub const fn is_valid(&self) -> bool {
        !matches!(self.kind, ResourceKind::Invalid)
    }

    /// First encoded properties word: class | kind | flags.
    pub fn word0(&self) -> u32 {
        (self.class as u32) | (self.kind as u32) << 8 | (self.flags.bits() as u32) << 16
    }

    /// Second encoded properties word: the element type id.
    pub fn word1(&self) -> u32 {
        self.elem.0
    }

    pub fn decode(word0: u32, word1: u32) -> Self {
        Self {
            class: ResourceClass::from_u32(word0 & 0xff),
            kind: ResourceKind::from_u32((word0 >> 8) & 0xff),
            elem: TypeRef(word1),
            flags: ResourceFlags::from_bits_truncate((word0 >> 16) as u16),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveState {
    /// Sentinel seeded before walking a handle's chain; observing it again
    /// means the chain is self-referential.
    InProgress,
    Resolved(ResourceProps),
}

/// Per-run resolver. The memo and the update-counter set are torn down with
/// the lowering run that owns them.
#[derive(Default)]
pub struct ResourceResolver {
    memo: HashMap<ValueRef, ResolveState>,
    update_counter_set: HashSet<ValueRef>,
    /// Number of actual chain walks performed (cache misses); observable so
    /// memoization is testable.
    pub chain_walks: usize,
}
impl ResourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_counter_set(&self) -> &HashSet<ValueRef> {
        &self.update_counter_set
    }

    pub fn into_update_counter_set(self) -> HashSet<ValueRef> {
        self.update_counter_set
    }

    /// Resolves a handle to its resource properties. Unresolvable handles
    /// report a user-facing error and yield `ResourceProps::invalid()`;
    /// callers must treat that as a hard stop, never a default.
    pub fn resolve(
        &mut self,
        m: &Module<'_>,
        handle: ValueRef,
        diags: &mut DiagSink,
    ) -> Result<ResourceProps, InvariantViolation> {
        match self.memo.get(&handle) {
            Some(ResolveState::Resolved(p)) => return Ok(*p),
            Some(ResolveState::InProgress) => {
                return Err(InvariantViolation::RecursiveHandleResolution(format!(
                    "{handle:?}"
                )));
            }
            None => (),
        }
        self.memo.insert(handle, ResolveState::InProgress);
        self.chain_walks += 1;

        let props = self.walk(m, handle, diags)?;
        self.memo.insert(handle, ResolveState::Resolved(props));
        Ok(props)
    }

    fn walk(
        &mut self,
        m: &Module<'_>,
        handle: ValueRef,
        diags: &mut DiagSink,
    ) -> Result<ResourceProps, InvariantViolation> {
        match m.instr(handle) {
            Some(Instr::HlCall { op: HlOp::AnnotateHandle, args }) => {
                let (Some(w0), Some(w1)) = (
                    m.const_int_value(args[1]),
                    m.const_int_value(args[2]),
                ) else {
                    return Err(InvariantViolation::MalformedCall(format!(
                        "annotate wrapper {handle:?} with non-constant properties"
                    )));
                };
                Ok(ResourceProps::decode(w0 as u32, w1 as u32))
            }
            Some(Instr::Select {
                on_true, on_false, ..
            }) => {
                let (a, b) = (*on_true, *on_false);
                let pa = self.resolve(m, a, diags)?;
                let pb = self.resolve(m, b, diags)?;
                if !pa.is_valid() || !pb.is_valid() {
                    // the failing arm already reported
                    Ok(ResourceProps::invalid())
                } else if pa == pb {
                    Ok(pa)
                } else {
                    diags.report(Diag::error(
                        m.loc_of(handle),
                        "cannot map resource to handle",
                    ));
                    Ok(ResourceProps::invalid())
                }
            }
            Some(Instr::Phi(incomings)) => {
                let incomings = incomings.clone();
                let mut resolved: Option<ResourceProps> = None;
                let mut failed_arm = false;
                for v in incomings {
                    // a back edge re-feeding this phi resolves through the
                    // sentinel path; skip self references
                    if v == handle {
                        continue;
                    }
                    let p = self.resolve(m, v, diags)?;
                    if !p.is_valid() {
                        failed_arm = true;
                        continue;
                    }
                    match resolved {
                        None => resolved = Some(p),
                        Some(prev) if prev == p => (),
                        Some(_) => {
                            diags.report(Diag::error(
                                m.loc_of(handle),
                                "cannot map resource to handle",
                            ));
                            return Ok(ResourceProps::invalid());
                        }
                    }
                }
                if failed_arm {
                    // each failing arm already reported
                    return Ok(ResourceProps::invalid());
                }
                match resolved {
                    Some(p) => Ok(p),
                    None => {
                        diags.report(Diag::error(
                            m.loc_of(handle),
                            "cannot map resource to handle",
                        ));
                        Ok(ResourceProps::invalid())
                    }
                }
            }
            _ => {
                // raw create-handle, casts, anything else: the front end is
                // required to funnel every handle through the annotate wrapper
                diags.report(Diag::error(
                    m.loc_of(handle),
                    "cannot map resource to handle",
                ));
                Ok(ResourceProps::invalid())
            }
        }
    }

    /// Sets the counter-present bit on the nearest annotate wrapper of
    /// `handle` and records every underlying resource load feeding the
    /// create-handle (through select/phi/cast merges) in the update-counter
    /// set.
    pub fn mark_has_counter(
        &mut self,
        m: &mut Module<'_>,
        handle: ValueRef,
        diags: &mut DiagSink,
    ) -> Result<(), InvariantViolation> {
        let Some(Instr::HlCall { op: HlOp::AnnotateHandle, args }) = m.instr(handle) else {
            return Err(InvariantViolation::MalformedCall(format!(
                "counter mark on a handle without annotate wrapper: {handle:?}"
            )));
        };
        let args = args.clone();
        let props = self.resolve(m, handle, diags)?;
        if props.class != ResourceClass::Uav {
            return Err(InvariantViolation::CounterOnNonUav(format!("{handle:?}")));
        }

        let updated = ResourceProps {
            flags: props.flags | ResourceFlags::HAS_COUNTER,
            ..props
        };
        let w0_ty = m.ty_of(args[1]);
        let new_w0 = m.const_value(w0_ty, crate::ir::Constant::Int(updated.word0() as i64));
        m.set_call_operand(handle, 1, new_w0);
        self.memo
            .insert(handle, ResolveState::Resolved(updated));

        // walk to the create-handle's resource operand and flag every load or
        // cast reachable through control-flow merges
        let mut worklist = vec![args[0]];
        let mut visited = HashSet::new();
        while let Some(v) = worklist.pop() {
            if !visited.insert(v) {
                continue;
            }
            match m.instr(v) {
                Some(Instr::HlCall { op: HlOp::CreateHandle, args }) => {
                    worklist.push(args[0]);
                }
                Some(Instr::Select {
                    on_true, on_false, ..
                }) => {
                    worklist.push(*on_true);
                    worklist.push(*on_false);
                }
                Some(Instr::Phi(incomings)) => {
                    worklist.extend(incomings.iter().copied());
                }
                Some(Instr::Cast { value, .. }) => {
                    self.update_counter_set.insert(v);
                    worklist.push(*value);
                }
                Some(Instr::Load { .. }) => {
                    self.update_counter_set.insert(v);
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// The bound global symbol behind a handle, when it is statically known.
    pub fn bound_symbol(&self, m: &Module<'_>, handle: ValueRef) -> Option<GlobalId> {
        let mut v = handle;
        loop {
            match m.instr(v) {
                Some(Instr::HlCall { op: HlOp::AnnotateHandle, args })
                | Some(Instr::HlCall { op: HlOp::CreateHandle, args }) => v = args[0],
                Some(Instr::Cast {
                    op: CastOp::AddrSpaceCast | CastOp::BitCast,
                    value,
                }) => v = *value,
                _ => break,
            }
        }
        match m.value(v) {
            crate::ir::ValueData::Global { id, .. } => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete_type::ScalarType;
    use crate::ir::Module;
    use crate::source_loc::SourceLoc;
    use smallvec::smallvec;

    fn annotated_handle(m: &mut Module<'_>, props: ResourceProps) -> ValueRef {
        let hty = m.types.handle();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let g = m.define_global("buf", hty);
        let raw = m.push_instr(
            f,
            hty,
            Instr::HlCall {
                op: HlOp::CreateHandle,
                args: smallvec![g],
            },
            SourceLoc::UNKNOWN,
        );
        let w0 = m.const_u32(props.word0());
        let w1 = m.const_u32(props.word1());
        m.push_instr(
            f,
            hty,
            Instr::HlCall {
                op: HlOp::AnnotateHandle,
                args: smallvec![raw, w0, w1],
            },
            SourceLoc::UNKNOWN,
        )
    }

    fn uav_structured(m: &mut Module<'_>) -> ResourceProps {
        let elem = m.types.scalar(ScalarType::Float);
        ResourceProps {
            class: ResourceClass::Uav,
            kind: ResourceKind::StructuredBuffer,
            elem,
            flags: ResourceFlags::empty(),
        }
    }

    #[test]
    fn props_words_round_trip() {
        let mut m = Module::new();
        let p = uav_structured(&mut m);
        assert_eq!(ResourceProps::decode(p.word0(), p.word1()), p);
    }

    #[test]
    fn resolve_is_memoized() {
        let mut m = Module::new();
        let props = uav_structured(&mut m);
        let h = annotated_handle(&mut m, props);
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        assert_eq!(r.resolve(&m, h, &mut diags).unwrap(), props);
        assert_eq!(r.resolve(&m, h, &mut diags).unwrap(), props);
        assert_eq!(r.chain_walks, 1);
        assert!(diags.is_empty());
    }

    #[test]
    fn unannotated_handle_is_a_user_error_not_a_default() {
        let mut m = Module::new();
        let hty = m.types.handle();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let g = m.define_global("buf", hty);
        let raw = m.push_instr(
            f,
            hty,
            Instr::HlCall {
                op: HlOp::CreateHandle,
                args: smallvec![g],
            },
            SourceLoc::UNKNOWN,
        );
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        let p = r.resolve(&m, raw, &mut diags).unwrap();
        assert!(!p.is_valid());
        assert!(diags.has_errors());
    }

    #[test]
    fn select_of_matching_handles_resolves() {
        let mut m = Module::new();
        let props = uav_structured(&mut m);
        let a = annotated_handle(&mut m, props);
        let b = annotated_handle(&mut m, props);
        let cond = m.const_bool(true);
        let hty = m.types.handle();
        let f = crate::ir::FuncRef(0);
        let sel = m.push_instr(
            f,
            hty,
            Instr::Select {
                cond,
                on_true: a,
                on_false: b,
            },
            SourceLoc::UNKNOWN,
        );
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        assert_eq!(r.resolve(&m, sel, &mut diags).unwrap(), props);
    }

    fn raw_handle(m: &mut Module<'_>, f: crate::ir::FuncRef) -> ValueRef {
        let hty = m.types.handle();
        let g = m.define_global("buf", hty);
        m.push_instr(
            f,
            hty,
            Instr::HlCall {
                op: HlOp::CreateHandle,
                args: smallvec![g],
            },
            SourceLoc::UNKNOWN,
        )
    }

    #[test]
    fn merge_of_unmappable_arms_reports_each_arm_once() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let a = raw_handle(&mut m, f);
        let b = raw_handle(&mut m, f);
        let cond = m.const_bool(true);
        let hty = m.types.handle();
        let sel = m.push_instr(
            f,
            hty,
            Instr::Select {
                cond,
                on_true: a,
                on_false: b,
            },
            SourceLoc::UNKNOWN,
        );
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        assert!(!r.resolve(&m, sel, &mut diags).unwrap().is_valid());
        assert_eq!(diags.len(), 2, "one report per arm, none at the merge");

        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let a = raw_handle(&mut m, f);
        let b = raw_handle(&mut m, f);
        let hty = m.types.handle();
        let phi = m.push_instr(f, hty, Instr::Phi(smallvec![a, b]), SourceLoc::UNKNOWN);
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        assert!(!r.resolve(&m, phi, &mut diags).unwrap().is_valid());
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn mark_has_counter_sets_bit_and_collects_loads() {
        let mut m = Module::new();
        let props = uav_structured(&mut m);
        let h = annotated_handle(&mut m, props);
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        r.mark_has_counter(&mut m, h, &mut diags).unwrap();
        let p = r.resolve(&m, h, &mut diags).unwrap();
        assert!(p.flags.contains(ResourceFlags::HAS_COUNTER));
        assert!(diags.is_empty());
    }

    #[test]
    fn mark_has_counter_on_srv_is_an_invariant_violation() {
        let mut m = Module::new();
        let elem = m.types.scalar(ScalarType::Float);
        let props = ResourceProps {
            class: ResourceClass::Srv,
            kind: ResourceKind::StructuredBuffer,
            elem,
            flags: ResourceFlags::empty(),
        };
        let h = annotated_handle(&mut m, props);
        let mut r = ResourceResolver::new();
        let mut diags = DiagSink::new();
        assert!(r.mark_has_counter(&mut m, h, &mut diags).is_err());
    }
}
