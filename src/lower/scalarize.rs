//! Scalarization / native-vector emission for elementwise hardware
//! operations: either one full-width call (when the target is capable) or one
//! scalar call per lane, lanes visited in ascending order. Lane order is what
//! fixes the relative order of side-effecting calls on the scalarized path,
//! so it must never be permuted.

use smallvec::SmallVec;

use crate::concrete_type::{TypeData, TypeRef};
use crate::hwop::HwOp;
use crate::ir::{Instr, ValueRef};

use super::LowerCtx;

/// Emits `op` over `args` with the given operand overload type. `ret_ty` is
/// the final result type (it may differ in scalar kind from the overload,
/// e.g. the float-class checks return bools). `args` excludes the opcode
/// constant; vector operands of the overload width are distributed per lane,
/// anything else (handles, selector constants) passes through unchanged.
pub fn emit_elementwise(
    ctx: &mut LowerCtx<'_, '_>,
    op: HwOp,
    ret_ty: TypeRef,
    overload: TypeRef,
    args: &[ValueRef],
) -> ValueRef {
    let width = ctx.module.types.vector_width(overload).unwrap_or(1);
    let elem = ctx.module.types.scalar_of(overload);

    if width > 1 {
        if let Some(elem) = elem {
            if ctx.target.supports_native_vector(op, elem) {
                return ctx.emit_hw(op, ret_ty, args);
            }
        }
    }

    if width <= 1 {
        return ctx.emit_hw(op, ret_ty, args);
    }

    let scalar_ret = match *ctx.module.types.data(ret_ty) {
        TypeData::Vector(s, _) => ctx.module.types.scalar(s),
        _ => ret_ty,
    };

    let mut result = ctx.module.undef(ret_ty);
    for lane in 0..width {
        let mut lane_args: SmallVec<[ValueRef; 4]> = SmallVec::new();
        for &a in args {
            let distribute = ctx
                .module
                .types
                .vector_width(ctx.module.ty_of(a))
                .is_some_and(|w| w == width && w > 1);
            if distribute {
                let s = match *ctx.module.types.data(ctx.module.ty_of(a)) {
                    TypeData::Vector(s, _) => s,
                    _ => unreachable!(),
                };
                let sty = ctx.module.types.scalar(s);
                lane_args.push(ctx.emit(sty, Instr::ExtractElement { vector: a, lane }));
            } else {
                lane_args.push(a);
            }
        }
        let r = ctx.emit_hw(op, scalar_ret, &lane_args);
        result = ctx.emit(
            ret_ty,
            Instr::InsertElement {
                vector: result,
                value: r,
                lane,
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete_type::ScalarType;
    use crate::diag::DiagSink;
    use crate::hwop::Target;
    use crate::ir::{Cursor, Module, ValueData};
    use crate::lower::LowerCtx;
    use crate::source_loc::SourceLoc;

    fn ctx_over<'m, 's>(
        module: &'m mut Module<'s>,
        target: &'m Target,
        diags: &'m mut DiagSink,
        cursor: Cursor,
    ) -> LowerCtx<'m, 's> {
        LowerCtx::new(module, target, diags, cursor, SourceLoc::UNKNOWN)
    }

    #[test]
    fn scalarizes_in_ascending_lane_order() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let f4 = m.types.vector(ScalarType::Float, 4);
        let x = m.undef(f4);
        let target = Target::default();
        let mut diags = DiagSink::new();
        let mut ctx = ctx_over(&mut m, &target, &mut diags, Cursor { func: f, at: 0 });

        let r = emit_elementwise(&mut ctx, HwOp::Sin, f4, f4, &[x]);
        assert_eq!(ctx.module.ty_of(r), f4);

        // expect: 4x (extract, call, insert) triplets, lanes 0..4 in order
        let body = ctx.module.func(f).body.clone();
        let mut lanes_seen = Vec::new();
        for v in body {
            if let Some(Instr::ExtractElement { lane, .. }) = ctx.module.instr(v) {
                lanes_seen.push(*lane);
            }
        }
        assert_eq!(lanes_seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn native_vector_path_emits_single_call() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let f4 = m.types.vector(ScalarType::Float, 4);
        let x = m.undef(f4);
        let target = Target {
            native_vectors: true,
            shader_model: (6, 9),
            ..Target::default()
        };
        let mut diags = DiagSink::new();
        let mut ctx = ctx_over(&mut m, &target, &mut diags, Cursor { func: f, at: 0 });

        let r = emit_elementwise(&mut ctx, HwOp::Sin, f4, f4, &[x]);
        assert_eq!(ctx.module.func(f).body.len(), 1);
        assert!(matches!(
            ctx.module.value(r),
            ValueData::Instr {
                instr: Instr::HwCall { op: HwOp::Sin, .. },
                ..
            }
        ));
    }

    #[test]
    fn scalar_width_bypasses_vector_machinery() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let f1 = m.types.scalar(ScalarType::Float);
        let x = m.undef(f1);
        let target = Target::default();
        let mut diags = DiagSink::new();
        let mut ctx = ctx_over(&mut m, &target, &mut diags, Cursor { func: f, at: 0 });

        emit_elementwise(&mut ctx, HwOp::Sqrt, f1, f1, &[x]);
        assert_eq!(ctx.module.func(f).body.len(), 1);
    }
}
