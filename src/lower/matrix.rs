//! Matrix loads and stores against buffer memory. A matrix lives in memory as
//! one vector per major (row if row-major, column otherwise); the flat value
//! the front end works with orders its lanes by the orientation selector
//! carried on the access, so loads scatter lanes and stores gather them.

use smallvec::SmallVec;

use crate::concrete_type::{TypeData, TypeRef};
use crate::diag::{Diag, InvariantViolation};
use crate::ir::{AccessStep, AccessStepKind, Instr, ValueRef};

use super::buffer::{
    add_scaled, emit_load, emit_store, translate_ptr_users, Access, Layout, OffsetPolicy,
};
use super::{LowerCtx, LoweredCall};

/// Lane index of element (r, c) in the flat value under an orientation.
fn flat_lane(row_oriented: bool, rows: u8, cols: u8, r: u32, c: u32) -> u32 {
    if row_oriented {
        r * cols as u32 + c
    } else {
        c * rows as u32 + r
    }
}

pub(crate) fn emit_mat_load(
    ctx: &mut LowerCtx<'_, '_>,
    access: &Access,
    orient: ValueRef,
    ret: TypeRef,
) -> ValueRef {
    let TypeData::Matrix { elem, rows, cols, row_major } = *ctx.module.types.data(access.ty)
    else {
        return ctx.poison_with(ret, "matrix access on a non-matrix value");
    };
    let Some(o) = ctx.module.const_int_value(orient) else {
        return ctx.poison_with(ret, "matrix orientation selector must be constant");
    };
    let row_oriented = o == 0;
    let policy = access.layout.policy();
    let (majors, minors) = if row_major { (rows, cols) } else { (cols, rows) };
    let minor_ty = ctx.module.types.vector(elem, minors);

    let n = rows as u32 * cols as u32;
    let mut lanes: Vec<Option<ValueRef>> = vec![None; n as usize];
    for m in 0..majors as u32 {
        let (r0, c0) = if row_major { (m, 0) } else { (0, m) };
        let base =
            policy.matrix_elem_offset(&ctx.module.types, elem, rows, cols, row_major, r0, c0);
        let sub = Access {
            offset: access.offset.advanced(base),
            ty: minor_ty,
            ..*access
        };
        let v = emit_load(ctx, &sub);
        let parts = ctx.explode(v);
        for (k, &p) in parts.iter().enumerate() {
            let (r, c) = if row_major { (m, k as u32) } else { (k as u32, m) };
            lanes[flat_lane(row_oriented, rows, cols, r, c) as usize] = Some(p);
        }
    }
    let lanes: SmallVec<[ValueRef; 16]> = lanes.into_iter().flatten().collect();
    ctx.build_vector(ret, &lanes)
}

pub(crate) fn emit_mat_store(
    ctx: &mut LowerCtx<'_, '_>,
    access: &Access,
    value: ValueRef,
    orient: ValueRef,
) {
    let TypeData::Matrix { elem, rows, cols, row_major } = *ctx.module.types.data(access.ty)
    else {
        ctx.diags
            .report(Diag::error(ctx.loc, "matrix access on a non-matrix value"));
        return;
    };
    let Some(o) = ctx.module.const_int_value(orient) else {
        ctx.diags.report(Diag::error(
            ctx.loc,
            "matrix orientation selector must be constant",
        ));
        return;
    };
    let row_oriented = o == 0;
    let policy = access.layout.policy();
    let (majors, minors) = if row_major { (rows, cols) } else { (cols, rows) };
    let minor_ty = ctx.module.types.vector(elem, minors);

    let flat = ctx.explode(value);
    for m in 0..majors as u32 {
        let (r0, c0) = if row_major { (m, 0) } else { (0, m) };
        let base =
            policy.matrix_elem_offset(&ctx.module.types, elem, rows, cols, row_major, r0, c0);
        let sub = Access {
            offset: access.offset.advanced(base),
            ty: minor_ty,
            ..*access
        };
        let mut parts: SmallVec<[ValueRef; 4]> = SmallVec::new();
        for k in 0..minors as u32 {
            let (r, c) = if row_major { (m, k) } else { (k, m) };
            parts.push(flat[flat_lane(row_oriented, rows, cols, r, c) as usize]);
        }
        let v = if parts.len() == 1 {
            parts[0]
        } else {
            ctx.build_vector(minor_ty, &parts)
        };
        emit_store(ctx, &sub, v);
    }
}

/// How one subscripted row of an in-buffer matrix maps to memory: rows of a
/// row-major matrix are contiguous and narrow to a plain vector access, rows
/// of a column-major matrix land one scalar access per lane.
pub(crate) enum RowAccess {
    Contiguous(Access),
    Scattered(SmallVec<[Access; 4]>),
}

/// Narrows a matrix access to one row by its index. Subscripting always
/// selects a logical row; lane addresses come from the same per-element
/// offset function as whole-matrix and single-element access.
pub(crate) fn row_access(
    ctx: &mut LowerCtx<'_, '_>,
    access: &Access,
    index: ValueRef,
) -> Option<RowAccess> {
    let TypeData::Matrix { elem, rows, cols, row_major } = *ctx.module.types.data(access.ty)
    else {
        ctx.diags
            .report(Diag::error(ctx.loc, "matrix access on a non-matrix value"));
        return None;
    };
    let policy = access.layout.policy();
    let row_ty = ctx.module.types.vector(elem, cols);
    match ctx.module.const_int_value(index) {
        Some(r) => {
            if r < 0 || r >= rows as i64 {
                ctx.diags.report(Diag::error(
                    ctx.loc,
                    format!("matrix row index {r} is out of range"),
                ));
                return None;
            }
            let r = r as u32;
            if row_major {
                let off =
                    policy.matrix_elem_offset(&ctx.module.types, elem, rows, cols, true, r, 0);
                Some(RowAccess::Contiguous(Access {
                    offset: access.offset.advanced(off),
                    ty: row_ty,
                    ..*access
                }))
            } else {
                let sty = ctx.module.types.scalar(elem);
                let mut lanes: SmallVec<[Access; 4]> = SmallVec::new();
                for c in 0..cols as u32 {
                    let off = policy
                        .matrix_elem_offset(&ctx.module.types, elem, rows, cols, false, r, c);
                    lanes.push(Access {
                        offset: access.offset.advanced(off),
                        ty: sty,
                        ..*access
                    });
                }
                Some(RowAccess::Scattered(lanes))
            }
        }
        // a dynamic row index scales by the row stride; only a row-major
        // matrix keeps its rows a fixed stride apart in memory
        None if row_major => {
            let stride = policy.matrix_elem_offset(&ctx.module.types, elem, rows, cols, true, 1, 0);
            let off = add_scaled(ctx, access.offset, index, stride);
            Some(RowAccess::Contiguous(Access {
                offset: off,
                ty: row_ty,
                ..*access
            }))
        }
        None => {
            ctx.diags.report(Diag::error(
                ctx.loc,
                "a dynamic matrix row index requires a row-major matrix",
            ));
            None
        }
    }
}

/// Consumes the users of a scattered row pointer: loads gather the lanes,
/// stores fan out, a constant component chain narrows to one lane.
pub(crate) fn translate_row_users(
    ctx: &mut LowerCtx<'_, '_>,
    ptr: ValueRef,
    lanes: &[Access],
) -> Result<bool, InvariantViolation> {
    let users: Vec<ValueRef> = ctx.module.uses(ptr).to_vec();
    let mut all = true;
    for u in users {
        if ctx.module.is_erased(u) {
            continue;
        }
        let saved = (ctx.cursor, ctx.loc);
        if let Some(cur) = ctx.module.position_of(u) {
            ctx.cursor = cur;
            ctx.loc = ctx.module.loc_of(u);
        }
        let done = translate_one_row_user(ctx, ptr, u, lanes)?;
        (ctx.cursor, ctx.loc) = saved;
        all &= done;
    }
    Ok(all)
}

fn translate_one_row_user(
    ctx: &mut LowerCtx<'_, '_>,
    ptr: ValueRef,
    u: ValueRef,
    lanes: &[Access],
) -> Result<bool, InvariantViolation> {
    match ctx.module.instr(u) {
        Some(Instr::Load { .. }) => {
            let ret = ctx.module.ty_of(u);
            let mut parts: SmallVec<[ValueRef; 4]> = SmallVec::new();
            for a in lanes {
                parts.push(emit_load(ctx, a));
            }
            let v = ctx.build_vector(ret, &parts);
            ctx.module.replace_all_uses(u, v);
            ctx.module.erase(u);
            Ok(true)
        }
        Some(&Instr::Store { ptr: sp, value }) => {
            if sp != ptr || value == ptr {
                ctx.diags.report(Diag::error(
                    ctx.loc,
                    "unsupported use of a resource subscript",
                ));
                return Ok(false);
            }
            let parts = ctx.explode(value);
            for (a, &p) in lanes.iter().zip(&parts) {
                emit_store(ctx, a, p);
            }
            ctx.module.erase(u);
            Ok(true)
        }
        Some(Instr::AccessChain { base, steps }) => {
            let base = *base;
            let lane = match steps.as_slice() {
                [AccessStep { kind: AccessStepKind::Vector, index }] => {
                    ctx.module.const_int_value(*index)
                }
                _ => None,
            };
            if base != ptr {
                ctx.diags.report(Diag::error(
                    ctx.loc,
                    "unsupported use of a resource subscript",
                ));
                return Ok(false);
            }
            let Some(c) = lane else {
                ctx.diags.report(Diag::error(
                    ctx.loc,
                    "dynamic component access is not available on a column-major matrix row",
                ));
                return Ok(false);
            };
            if c < 0 || c as usize >= lanes.len() {
                ctx.diags.report(Diag::error(
                    ctx.loc,
                    format!(
                        "vector component {c} is out of range for a {}-component vector",
                        lanes.len()
                    ),
                ));
                return Ok(false);
            }
            let done = translate_ptr_users(ctx, u, &lanes[c as usize])?;
            if done && ctx.module.uses(u).is_empty() {
                ctx.module.erase(u);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        _ => {
            ctx.diags.report(Diag::error(
                ctx.loc,
                "unsupported use of a resource subscript",
            ));
            Ok(false)
        }
    }
}

/// Narrows a matrix access to one element by its flat row-major index.
pub(crate) fn element_access(
    ctx: &mut LowerCtx<'_, '_>,
    access: &Access,
    index: ValueRef,
) -> Option<Access> {
    let TypeData::Matrix { elem, rows, cols, row_major } = *ctx.module.types.data(access.ty)
    else {
        ctx.diags
            .report(Diag::error(ctx.loc, "matrix access on a non-matrix value"));
        return None;
    };
    let sty = ctx.module.types.scalar(elem);
    let policy = access.layout.policy();
    match ctx.module.const_int_value(index) {
        Some(i) => {
            let n = rows as i64 * cols as i64;
            if i < 0 || i >= n {
                ctx.diags.report(Diag::error(
                    ctx.loc,
                    format!("matrix element index {i} is out of range"),
                ));
                return None;
            }
            let (r, c) = (i as u32 / cols as u32, i as u32 % cols as u32);
            let off = policy.matrix_elem_offset(&ctx.module.types, elem, rows, cols, row_major, r, c);
            Some(Access {
                offset: access.offset.advanced(off),
                ty: sty,
                ..*access
            })
        }
        // a dynamic flat index only lines up with memory when the flat order
        // and the memory order are both row-major and strides are element-sized
        None if access.layout == Layout::Linear && row_major => {
            let off = add_scaled(ctx, access.offset, index, elem.byte_size());
            Some(Access {
                offset: off,
                ty: sty,
                ..*access
            })
        }
        None => {
            ctx.diags.report(Diag::error(
                ctx.loc,
                "dynamic matrix element access requires a row-major matrix in the linear layout",
            ));
            None
        }
    }
}

/// Matrix memory calls always hang off a resource subscript and are consumed
/// by its user walk. One reaching the driver directly has no memory to
/// address.
pub(crate) fn lower_orphan_access(
    ctx: &mut LowerCtx<'_, '_>,
    ret: TypeRef,
) -> Result<LoweredCall, InvariantViolation> {
    ctx.diags.report(Diag::error(
        ctx.loc,
        "matrix memory access outside a resource subscript",
    ));
    if *ctx.module.types.data(ret) == TypeData::Void {
        Ok(LoweredCall::EraseOnly)
    } else {
        Ok(LoweredCall::Replace(ctx.module.poison(ret)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete_type::ScalarType;
    use crate::diag::DiagSink;
    use crate::hwop::{HwOp, Target};
    use crate::ir::{Cursor, Instr, Module};
    use crate::lower::buffer::Offset;
    use crate::lower::resource::{ResourceClass, ResourceFlags, ResourceKind, ResourceProps};
    use crate::source_loc::SourceLoc;

    fn structured_access<'s>(m: &mut Module<'s>, elem: TypeRef, ty: TypeRef) -> Access {
        let hty = m.types.handle();
        let handle = m.define_global("buf", hty);
        Access {
            handle,
            props: ResourceProps {
                class: ResourceClass::Uav,
                kind: ResourceKind::StructuredBuffer,
                elem,
                flags: ResourceFlags::empty(),
            },
            typed_index: None,
            offset: Offset::ZERO,
            ty,
            layout: Layout::Linear,
        }
    }

    #[test]
    fn row_major_load_reads_one_vector_per_row() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let mat = m.types.matrix(ScalarType::Float, 2, 2, true);
        let f1 = m.types.scalar(ScalarType::Float);
        let flat = m.types.vector(ScalarType::Float, 4);
        let access = structured_access(&mut m, f1, mat);

        let target = Target::default();
        let mut diags = DiagSink::new();
        let mut ctx = LowerCtx::new(
            &mut m,
            &target,
            &mut diags,
            Cursor { func: f, at: 0 },
            SourceLoc::UNKNOWN,
        );
        let orient = ctx.module.const_u32(0);
        emit_mat_load(&mut ctx, &access, orient, flat);

        let body = m.func(f).body.clone();
        let mut row_offsets = Vec::new();
        for v in body {
            if let Some(Instr::HwCall { op: HwOp::RawBufLoad, args }) = m.instr(v) {
                row_offsets.push(m.const_int_value(args[2]));
            }
        }
        // 2x2 float rows are 8 bytes apart
        assert_eq!(row_offsets, vec![Some(0), Some(8)]);
    }

    #[test]
    fn row_and_element_subscripts_agree_on_addresses() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let mat = m.types.matrix(ScalarType::Float, 4, 4, false);
        let f1 = m.types.scalar(ScalarType::Float);
        let access = structured_access(&mut m, f1, mat);

        let target = Target::default();
        let mut diags = DiagSink::new();
        let mut ctx = LowerCtx::new(
            &mut m,
            &target,
            &mut diags,
            Cursor { func: f, at: 0 },
            SourceLoc::UNKNOWN,
        );
        let i2 = ctx.module.const_u32(2);
        let lanes = match row_access(&mut ctx, &access, i2) {
            Some(RowAccess::Scattered(l)) => l,
            _ => panic!("a column-major row scatters"),
        };
        for (c, lane) in lanes.iter().enumerate() {
            // flat row-major index of (2, c)
            let flat = ctx.module.const_u32(2 * 4 + c as u32);
            let sub = element_access(&mut ctx, &access, flat).unwrap();
            assert_eq!(lane.offset.base, sub.offset.base);
        }
    }

    #[test]
    fn element_index_maps_through_the_layout() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let mat = m.types.matrix(ScalarType::Float, 4, 4, false);
        let f1 = m.types.scalar(ScalarType::Float);
        let mut access = structured_access(&mut m, f1, mat);

        let target = Target::default();
        let mut diags = DiagSink::new();
        let mut ctx = LowerCtx::new(
            &mut m,
            &target,
            &mut diags,
            Cursor { func: f, at: 0 },
            SourceLoc::UNKNOWN,
        );
        // flat index 6 = row 1, col 2; column-major linear puts it at
        // (2*4 + 1) * 4 bytes
        let i6 = ctx.module.const_u32(6);
        let sub = match element_access(&mut ctx, &access, i6) {
            Some(s) => s,
            None => panic!("constant index must resolve"),
        };
        assert_eq!(sub.offset.base, 36);

        // the same access under the legacy regime lands on register 2,
        // channel 1
        access.layout = Layout::Legacy;
        let sub = match element_access(&mut ctx, &access, i6) {
            Some(s) => s,
            None => panic!("constant index must resolve"),
        };
        assert_eq!(sub.offset.base, 2 * 16 + 4);
    }
}
