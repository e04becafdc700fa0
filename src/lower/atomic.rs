//! Atomic translation: interlocked requests either become native in-memory
//! atomics (group-shared and node-record address spaces) or resource atomic
//! calls on a UAV element, after a legality check. Anything else is a
//! user-facing error with no emitted operation.

use crate::concrete_type::{AddrSpace, ScalarType, TypeData};
use crate::diag::{Diag, InvariantViolation};
use crate::hlop::HlOp;
use crate::hwop::{AtomicKind, HwOp};
use crate::ir::{CastOp, Instr, Module, ValueRef};

use super::buffer::{offset_value, Access};
use super::resource::{ResourceClass, ResourceKind};
use super::{LowerCtx, LoweredCall};

const BAD_TARGET: &str = "atomic operation targets must be groupshared, node record, or UAV";

/// Address space of a pointer after stripping value-preserving casts.
pub fn classify(m: &Module<'_>, mut p: ValueRef) -> Option<AddrSpace> {
    loop {
        match m.instr(p) {
            Some(Instr::Cast {
                op: CastOp::AddrSpaceCast | CastOp::BitCast,
                value,
            }) => p = *value,
            _ => break,
        }
    }
    match *m.types.data(m.ty_of(p)) {
        TypeData::Ptr { addr_space, .. } => Some(addr_space),
        _ => None,
    }
}

/// Atomic selector for an interlocked opcode, given the value signedness.
/// `None` for the compare-exchange forms, which have their own shape.
pub fn interlocked_kind(op: HlOp, signed: bool) -> Option<AtomicKind> {
    Some(match op {
        HlOp::InterlockedAdd => AtomicKind::Add,
        HlOp::InterlockedAnd => AtomicKind::And,
        HlOp::InterlockedOr => AtomicKind::Or,
        HlOp::InterlockedXor => AtomicKind::Xor,
        HlOp::InterlockedMin => {
            if signed {
                AtomicKind::IMin
            } else {
                AtomicKind::UMin
            }
        }
        HlOp::InterlockedMax => {
            if signed {
                AtomicKind::IMax
            } else {
                AtomicKind::UMax
            }
        }
        HlOp::InterlockedUMin => AtomicKind::UMin,
        HlOp::InterlockedUMax => AtomicKind::UMax,
        HlOp::InterlockedExchange => AtomicKind::Exchange,
        _ => return None,
    })
}

pub const fn is_interlocked(op: HlOp) -> bool {
    matches!(
        op,
        HlOp::InterlockedAdd
            | HlOp::InterlockedAnd
            | HlOp::InterlockedOr
            | HlOp::InterlockedXor
            | HlOp::InterlockedMin
            | HlOp::InterlockedMax
            | HlOp::InterlockedUMin
            | HlOp::InterlockedUMax
            | HlOp::InterlockedExchange
            | HlOp::InterlockedCompareExchange
            | HlOp::InterlockedCompareStore
    )
}

fn atomic_int_type(ctx: &mut LowerCtx<'_, '_>, value: ValueRef) -> Option<ScalarType> {
    let s = ctx
        .module
        .types
        .scalar_of(ctx.module.ty_of(value))
        .unwrap_or(ScalarType::UInt32)
        .as_int_of_same_width();
    if !ctx.target.supports_atomic(s) {
        ctx.diags.report(Diag::error(
            ctx.loc,
            "this target does not support atomics of this width",
        ));
        return None;
    }
    Some(s)
}

/// Bit-casts a float operand to its same-width integer form; integers pass
/// through.
fn to_atomic_int(ctx: &mut LowerCtx<'_, '_>, value: ValueRef, int_s: ScalarType) -> ValueRef {
    let s = ctx
        .module
        .types
        .scalar_of(ctx.module.ty_of(value))
        .unwrap_or(int_s);
    if !s.is_float() {
        return value;
    }
    let ity = ctx.module.types.scalar(int_s);
    ctx.emit(
        ity,
        Instr::Cast {
            op: CastOp::BitCast,
            value,
        },
    )
}

pub(crate) fn store_original(
    ctx: &mut LowerCtx<'_, '_>,
    out: ValueRef,
    result: ValueRef,
    value_was_float: ValueRef,
) {
    let s = ctx
        .module
        .types
        .scalar_of(ctx.module.ty_of(value_was_float))
        .unwrap_or(ScalarType::UInt32);
    let back = if s.is_float() {
        let fty = ctx.module.types.scalar(s);
        ctx.emit(
            fty,
            Instr::Cast {
                op: CastOp::BitCast,
                value: result,
            },
        )
    } else {
        result
    };
    let void = ctx.module.types.void();
    ctx.emit(
        void,
        Instr::Store {
            ptr: out,
            value: back,
        },
    );
}

/// Interlocked update whose destination is a memory pointer. Resource
/// destinations are consumed earlier by the subscript walk, so a
/// non-groupshared, non-node-record pointer here is a user error.
pub(crate) fn lower_interlocked(
    ctx: &mut LowerCtx<'_, '_>,
    args: &[ValueRef],
    kind: AtomicKind,
) -> Result<LoweredCall, InvariantViolation> {
    let dest = args[0];
    let value = args[1];
    match classify(ctx.module, dest) {
        Some(AddrSpace::GroupShared | AddrSpace::NodeRecord) => (),
        _ => {
            ctx.diags.report(Diag::error(ctx.loc, BAD_TARGET));
            return Ok(LoweredCall::EraseOnly);
        }
    }
    let Some(int_s) = atomic_int_type(ctx, value) else {
        return Ok(LoweredCall::EraseOnly);
    };
    let v = to_atomic_int(ctx, value, int_s);
    let ity = ctx.module.types.scalar(int_s);
    let result = ctx.emit(
        ity,
        Instr::AtomicRmw {
            op: kind,
            ptr: dest,
            value: v,
        },
    );
    if let Some(&out) = args.get(2) {
        store_original(ctx, out, result, value);
    }
    Ok(LoweredCall::EraseOnly)
}

/// Compare-exchange on a memory pointer; `want_original` is false for the
/// compare-store form, which discards the read-back.
pub(crate) fn lower_cmpxchg(
    ctx: &mut LowerCtx<'_, '_>,
    args: &[ValueRef],
    want_original: bool,
) -> Result<LoweredCall, InvariantViolation> {
    let dest = args[0];
    let cmp = args[1];
    let new = args[2];
    match classify(ctx.module, dest) {
        Some(AddrSpace::GroupShared | AddrSpace::NodeRecord) => (),
        _ => {
            ctx.diags.report(Diag::error(ctx.loc, BAD_TARGET));
            return Ok(LoweredCall::EraseOnly);
        }
    }
    let Some(int_s) = atomic_int_type(ctx, new) else {
        return Ok(LoweredCall::EraseOnly);
    };
    let ci = to_atomic_int(ctx, cmp, int_s);
    let ni = to_atomic_int(ctx, new, int_s);
    let ity = ctx.module.types.scalar(int_s);
    let result = ctx.emit(
        ity,
        Instr::AtomicCmpXchg {
            ptr: dest,
            cmp: ci,
            new: ni,
        },
    );
    if want_original {
        if let Some(&out) = args.get(3) {
            store_original(ctx, out, result, new);
        }
    }
    Ok(LoweredCall::EraseOnly)
}

/// Checks that a resolved access may carry atomics at all. Reports and
/// returns false on user error.
fn check_resource_atomic(ctx: &mut LowerCtx<'_, '_>, access: &Access, value: ValueRef) -> bool {
    if access.props.class != ResourceClass::Uav {
        ctx.diags.report(Diag::error(ctx.loc, BAD_TARGET));
        return false;
    }
    if access.props.kind == ResourceKind::TypedBuffer
        && ctx.module.types.vector_width(access.props.elem) != Some(1)
    {
        ctx.diags.report(Diag::error(
            ctx.loc,
            "atomic operation on a typed buffer requires a scalar element type",
        ));
        return false;
    }
    let s = ctx
        .module
        .types
        .scalar_of(ctx.module.ty_of(value))
        .unwrap_or(ScalarType::UInt32)
        .as_int_of_same_width();
    if !ctx.target.supports_atomic(s) {
        ctx.diags.report(Diag::error(
            ctx.loc,
            "this target does not support atomics of this width",
        ));
        return false;
    }
    true
}

fn resource_coord(ctx: &mut LowerCtx<'_, '_>, access: &Access) -> ValueRef {
    match access.typed_index {
        Some(i) => i,
        None => offset_value(ctx, access.offset),
    }
}

/// Read-modify-write on a UAV element addressed by `access`. Returns the
/// pre-update value, or `None` when a user error was reported and nothing was
/// emitted.
pub(crate) fn emit_resource_atomic(
    ctx: &mut LowerCtx<'_, '_>,
    access: &Access,
    kind: AtomicKind,
    value: ValueRef,
) -> Option<ValueRef> {
    if !check_resource_atomic(ctx, access, value) {
        return None;
    }
    let int_s = ctx
        .module
        .types
        .scalar_of(ctx.module.ty_of(value))
        .unwrap_or(ScalarType::UInt32)
        .as_int_of_same_width();
    let v = to_atomic_int(ctx, value, int_s);
    let kindc = ctx.module.const_u32(kind as u32);
    let coord = resource_coord(ctx, access);
    let ity = ctx.module.types.scalar(int_s);
    Some(ctx.emit_hw(HwOp::AtomicBinOp, ity, &[access.handle, kindc, coord, v]))
}

pub(crate) fn emit_resource_cmpxchg(
    ctx: &mut LowerCtx<'_, '_>,
    access: &Access,
    cmp: ValueRef,
    new: ValueRef,
) -> Option<ValueRef> {
    if !check_resource_atomic(ctx, access, new) {
        return None;
    }
    let int_s = ctx
        .module
        .types
        .scalar_of(ctx.module.ty_of(new))
        .unwrap_or(ScalarType::UInt32)
        .as_int_of_same_width();
    let ci = to_atomic_int(ctx, cmp, int_s);
    let ni = to_atomic_int(ctx, new, int_s);
    let coord = resource_coord(ctx, access);
    let ity = ctx.module.types.scalar(int_s);
    Some(ctx.emit_hw(
        HwOp::AtomicCompareExchange,
        ity,
        &[access.handle, coord, ci, ni],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagSink;
    use crate::hwop::Target;
    use crate::ir::{Cursor, Module};
    use crate::source_loc::SourceLoc;
    use smallvec::smallvec;

    #[test]
    fn groupshared_add_becomes_native_atomic() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let i32ty = m.types.scalar(ScalarType::SInt32);
        let pty = m.types.ptr(i32ty, AddrSpace::GroupShared);
        let g = m.define_global("shared_v", pty);
        let val = m.const_i32(1);
        let site = m.push_instr(
            f,
            void,
            Instr::HlCall {
                op: HlOp::InterlockedAdd,
                args: smallvec![g, val],
            },
            SourceLoc::UNKNOWN,
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        let cur = m.position_of(site).unwrap();
        let mut ctx = LowerCtx::new(&mut m, &target, &mut diags, cur, SourceLoc::UNKNOWN);
        let r = lower_interlocked(&mut ctx, &[g, val], AtomicKind::Add).unwrap();
        assert_eq!(r, LoweredCall::EraseOnly);
        assert!(diags.is_empty());
        let has_native = m.func(f).body.iter().any(|&v| {
            matches!(
                m.instr(v),
                Some(Instr::AtomicRmw {
                    op: AtomicKind::Add,
                    ..
                })
            )
        });
        assert!(has_native);
    }

    #[test]
    fn default_address_space_pointer_is_rejected() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let i32ty = m.types.scalar(ScalarType::SInt32);
        let pty = m.types.ptr(i32ty, AddrSpace::Default);
        let g = m.define_global("plain", pty);
        let val = m.const_i32(1);
        let site = m.push_instr(
            f,
            void,
            Instr::HlCall {
                op: HlOp::InterlockedAdd,
                args: smallvec![g, val],
            },
            SourceLoc::UNKNOWN,
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        let cur = m.position_of(site).unwrap();
        let mut ctx = LowerCtx::new(&mut m, &target, &mut diags, cur, SourceLoc::UNKNOWN);
        lower_interlocked(&mut ctx, &[g, val], AtomicKind::Add).unwrap();
        assert!(diags.has_errors());
        // no native atomic and no hardware call was emitted
        assert!(!m.func(f).body.iter().any(|&v| matches!(
            m.instr(v),
            Some(Instr::AtomicRmw { .. } | Instr::HwCall { .. })
        )));
    }

    #[test]
    fn classification_strips_address_space_casts() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let i32ty = m.types.scalar(ScalarType::SInt32);
        let pty = m.types.ptr(i32ty, AddrSpace::GroupShared);
        let generic = m.types.ptr(i32ty, AddrSpace::Default);
        let g = m.define_global("shared_v", pty);
        let cast = m.push_instr(
            f,
            generic,
            Instr::Cast {
                op: CastOp::AddrSpaceCast,
                value: g,
            },
            SourceLoc::UNKNOWN,
        );
        assert_eq!(classify(&m, cast), Some(AddrSpace::GroupShared));
    }

    #[test]
    fn cursor_from_unused_site() {
        // keep the test module constructors honest about body positions
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let x = m.const_u32(0);
        let site = m.push_instr(f, void, Instr::Phi(smallvec![x]), SourceLoc::UNKNOWN);
        assert_eq!(m.position_of(site), Some(Cursor { func: f, at: 0 }));
    }
}
