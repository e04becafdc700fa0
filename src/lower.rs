//! The lowering driver: scans every high-level operation call in a module and
//! rewrites it into hardware operation calls and plain instructions, in place.
//!
//! Each call site is visited exactly once; erasure is the termination signal
//! for a site. User-facing errors produce a poison placeholder plus a deferred
//! diagnostic that is only emitted if the poison is still referenced when the
//! run finishes, so errors in code that later turns out to be dead do not
//! fail the compile.

pub mod atomic;
pub mod buffer;
pub mod matrix;
pub mod resource;
pub mod scalarize;

use std::collections::HashSet;

use smallvec::SmallVec;

use crate::concrete_type::{ScalarType, TypeData, TypeRef};
use crate::diag::{Diag, DiagSink, InvariantViolation};
use crate::hlop::HlOp;
use crate::hwop::{
    AtomicKind, BarrierMode, HwOp, QuadOpKind, Target, WaveBitKind, WaveOpKind,
};
use crate::ir::{BinOp, CastOp, CmpOp, Constant, Cursor, FuncRef, Instr, Module, ValueRef};
use crate::source_loc::SourceLoc;
use crate::utils::f32_to_f16_bits;

use self::resource::ResourceResolver;

/// How the driver finishes a call site after its lowering function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweredCall {
    /// Substitute all uses with this value and erase the call.
    Replace(ValueRef),
    /// The lowering consumed the site's semantics itself; erase the call.
    EraseOnly,
    /// Leave the call for a later pass (or because an error left it intact).
    Keep,
}

/// Results handed to later passes once a run completes.
pub struct LowerOutput {
    /// Instructions whose resource needs a counter-buffer companion.
    pub update_counter_set: HashSet<ValueRef>,
}

/// Shared state of one lowering run. The cursor and location track the call
/// site currently being rewritten; everything a lowering function emits lands
/// at the cursor carrying that location.
pub struct LowerCtx<'m, 's> {
    pub module: &'m mut Module<'s>,
    pub target: &'m Target,
    pub diags: &'m mut DiagSink,
    pub resources: ResourceResolver,
    pub cursor: Cursor,
    pub loc: SourceLoc,
    pending_poison: Vec<(ValueRef, Diag)>,
}

impl<'m, 's> LowerCtx<'m, 's> {
    pub fn new(
        module: &'m mut Module<'s>,
        target: &'m Target,
        diags: &'m mut DiagSink,
        cursor: Cursor,
        loc: SourceLoc,
    ) -> Self {
        Self {
            module,
            target,
            diags,
            resources: ResourceResolver::new(),
            cursor,
            loc,
            pending_poison: Vec::new(),
        }
    }

    // ---- emission primitives ----

    pub fn emit(&mut self, ty: TypeRef, instr: Instr) -> ValueRef {
        self.module.insert_instr(&mut self.cursor, ty, instr, self.loc)
    }

    /// Emits a hardware operation call; the numeric opcode constant is
    /// prepended as operand 0.
    pub fn emit_hw(&mut self, op: HwOp, ret: TypeRef, args: &[ValueRef]) -> ValueRef {
        let code = self.module.const_u32(op.code());
        let mut full: SmallVec<[ValueRef; 4]> = SmallVec::with_capacity(args.len() + 1);
        full.push(code);
        full.extend_from_slice(args);
        self.emit(ret, Instr::HwCall { op, args: full })
    }

    /// A distinct poison constant with a diagnostic that fires only if the
    /// poison survives to the end of the run with uses.
    pub fn poison_with(&mut self, ty: TypeRef, message: impl Into<String>) -> ValueRef {
        let p = self.module.poison(ty);
        self.pending_poison.push((p, Diag::error(self.loc, message)));
        p
    }

    // ---- value construction helpers ----

    pub fn build_vector(&mut self, ty: TypeRef, lanes: &[ValueRef]) -> ValueRef {
        let mut v = self.module.undef(ty);
        for (i, &l) in lanes.iter().enumerate() {
            v = self.emit(
                ty,
                Instr::InsertElement {
                    vector: v,
                    value: l,
                    lane: i as u32,
                },
            );
        }
        v
    }

    pub fn explode(&mut self, v: ValueRef) -> SmallVec<[ValueRef; 4]> {
        let ty = self.module.ty_of(v);
        let w = self.module.types.vector_width(ty).unwrap_or(1);
        if w == 1 {
            return SmallVec::from_slice(&[v]);
        }
        let TypeData::Vector(s, _) = *self.module.types.data(ty) else {
            unreachable!("explode on non-vector {v:?}")
        };
        let sty = self.module.types.scalar(s);
        (0..w)
            .map(|lane| self.emit(sty, Instr::ExtractElement { vector: v, lane }))
            .collect()
    }

    pub fn splat(&mut self, ty: TypeRef, scalar: ValueRef) -> ValueRef {
        let w = self.module.types.vector_width(ty).unwrap_or(1);
        if w == 1 {
            return scalar;
        }
        let lanes: SmallVec<[ValueRef; 4]> = (0..w).map(|_| scalar).collect();
        self.build_vector(ty, &lanes)
    }

    fn const_float(&mut self, s: ScalarType, x: f64) -> ValueRef {
        let ty = self.module.types.scalar(s);
        let bits = match s {
            ScalarType::Half => f32_to_f16_bits(x as f32) as u64,
            ScalarType::Float => (x as f32).to_bits() as u64,
            ScalarType::Double => x.to_bits(),
            other => unreachable!("float constant of {other:?}"),
        };
        self.module.const_value(ty, Constant::FloatBits(bits))
    }

    fn splat_float(&mut self, ty: TypeRef, x: f64) -> ValueRef {
        let Some(s) = self.module.types.scalar_of(ty) else {
            unreachable!("float splat of non-numeric type {ty:?}")
        };
        let c = self.const_float(s, x);
        self.splat(ty, c)
    }

    // ---- memory representation conversions ----

    /// `!= 0` conversion from the 32-bit memory form back to a logical bool.
    pub fn mem_to_bool(&mut self, v: ValueRef) -> ValueRef {
        let vty = self.module.ty_of(v);
        let zero = self.module.const_value(vty, Constant::Int(0));
        let bty = self.module.types.scalar(ScalarType::Bool);
        self.emit(
            bty,
            Instr::Cmp {
                op: CmpOp::Ne,
                lhs: v,
                rhs: zero,
            },
        )
    }

    pub fn bool_to_mem(&mut self, v: ValueRef) -> ValueRef {
        let i32ty = self.module.types.scalar(ScalarType::UInt32);
        self.emit(
            i32ty,
            Instr::Cast {
                op: CastOp::ZExt,
                value: v,
            },
        )
    }

    // ---- 64-bit split/merge ----

    /// Splits a 64-bit scalar into (lo, hi) 32-bit halves; doubles through the
    /// dedicated split operation, integers through truncate/shift.
    pub fn split64(&mut self, v: ValueRef) -> (ValueRef, ValueRef) {
        let vty = self.module.ty_of(v);
        let u32ty = self.module.types.scalar(ScalarType::UInt32);
        if self.module.types.scalar_of(vty) == Some(ScalarType::Double) {
            let pair = self.module.types.vector(ScalarType::UInt32, 2);
            let split = self.emit_hw(HwOp::SplitDouble, pair, &[v]);
            let lo = self.emit(u32ty, Instr::ExtractElement { vector: split, lane: 0 });
            let hi = self.emit(u32ty, Instr::ExtractElement { vector: split, lane: 1 });
            (lo, hi)
        } else {
            let lo = self.emit(u32ty, Instr::Cast { op: CastOp::Trunc, value: v });
            let sh32 = self.module.const_value(vty, Constant::Int(32));
            let shifted = self.emit(
                vty,
                Instr::Binary {
                    op: BinOp::LShr,
                    lhs: v,
                    rhs: sh32,
                },
            );
            let hi = self.emit(u32ty, Instr::Cast { op: CastOp::Trunc, value: shifted });
            (lo, hi)
        }
    }

    /// Recombines (lo, hi) 32-bit halves into a 64-bit scalar of type `ty`.
    pub fn merge64(&mut self, ty: TypeRef, lo: ValueRef, hi: ValueRef) -> ValueRef {
        if self.module.types.scalar_of(ty) == Some(ScalarType::Double) {
            return self.emit_hw(HwOp::MakeDouble, ty, &[lo, hi]);
        }
        let lo64 = self.emit(ty, Instr::Cast { op: CastOp::ZExt, value: lo });
        let hi64 = self.emit(ty, Instr::Cast { op: CastOp::ZExt, value: hi });
        let sh32 = self.module.const_value(ty, Constant::Int(32));
        let shifted = self.emit(
            ty,
            Instr::Binary {
                op: BinOp::Shl,
                lhs: hi64,
                rhs: sh32,
            },
        );
        self.emit(
            ty,
            Instr::Binary {
                op: BinOp::Or,
                lhs: lo64,
                rhs: shifted,
            },
        )
    }

    // ---- driver ----

    fn run(&mut self) -> Result<LowerOutput, InvariantViolation> {
        let nfuncs = self.module.functions.len();
        for fi in 0..nfuncs {
            let f = FuncRef(fi as u32);
            let mut i = 0;
            while i < self.module.func(f).body.len() {
                let v = self.module.func(f).body[i];
                let Some(Instr::HlCall { op, args }) = self.module.instr(v) else {
                    i += 1;
                    continue;
                };
                let op = *op;
                let args: SmallVec<[ValueRef; 4]> = args.clone();
                self.cursor = Cursor { func: f, at: i };
                self.loc = self.module.loc_of(v);
                log::debug!("lowering {} at {v:?}", op.name());
                match self.dispatch(v, op, &args)? {
                    LoweredCall::Replace(new) => {
                        self.module.replace_all_uses(v, new);
                        self.module.erase(v);
                        i = self.cursor.at;
                    }
                    LoweredCall::EraseOnly => {
                        self.module.erase(v);
                        i = self.cursor.at;
                    }
                    LoweredCall::Keep => i = self.cursor.at + 1,
                }
            }
        }
        self.finish()
    }

    fn finish(&mut self) -> Result<LowerOutput, InvariantViolation> {
        for (p, diag) in core::mem::take(&mut self.pending_poison) {
            if !self.module.uses(p).is_empty() {
                self.diags.report(diag);
            }
        }
        let resources = core::mem::take(&mut self.resources);
        Ok(LowerOutput {
            update_counter_set: resources.into_update_counter_set(),
        })
    }

    /// One lowering function per opcode; the match is the dispatch table, so
    /// an unmapped opcode is a build failure rather than a runtime gap.
    fn dispatch(
        &mut self,
        site: ValueRef,
        op: HlOp,
        args: &[ValueRef],
    ) -> Result<LoweredCall, InvariantViolation> {
        if let Some(n) = op.arity() {
            if args.len() < n {
                return Err(InvariantViolation::MalformedCall(format!(
                    "{} expects {n} operands, got {}",
                    op.name(),
                    args.len()
                )));
            }
        }
        let ret = self.module.ty_of(site);
        match op {
            // straight elementwise renames
            HlOp::Acos
            | HlOp::Asin
            | HlOp::Atan
            | HlOp::Cos
            | HlOp::Sin
            | HlOp::Tan
            | HlOp::Cosh
            | HlOp::Sinh
            | HlOp::Tanh
            | HlOp::Exp2
            | HlOp::Log2
            | HlOp::Sqrt
            | HlOp::Rsqrt
            | HlOp::Frac
            | HlOp::Round
            | HlOp::Floor
            | HlOp::Ceil
            | HlOp::Truncate
            | HlOp::IsNan
            | HlOp::IsInf
            | HlOp::IsFinite
            | HlOp::Saturate
            | HlOp::Countbits
            | HlOp::Reversebits
            | HlOp::FirstbitHi
            | HlOp::FirstbitLo
            | HlOp::FirstbitSHi
            | HlOp::DdxCoarse
            | HlOp::DdxFine
            | HlOp::DdyCoarse
            | HlOp::DdyFine
            | HlOp::F16ToF32
            | HlOp::F32ToF16 => {
                let hw = direct_elementwise_target(op);
                let overload = self.module.ty_of(args[0]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self, hw, ret, overload, args,
                )))
            }

            // base-e / base-10 forms in terms of the base-2 hardware ops
            HlOp::Exp => {
                let ty = self.module.ty_of(args[0]);
                let scale = self.splat_float(ty, core::f64::consts::LOG2_E);
                let x = self.emit(
                    ty,
                    Instr::Binary {
                        op: BinOp::FMul,
                        lhs: args[0],
                        rhs: scale,
                    },
                );
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self,
                    HwOp::Exp,
                    ret,
                    ty,
                    &[x],
                )))
            }
            HlOp::Log => Ok(LoweredCall::Replace(
                self.log_scaled(args[0], ret, core::f64::consts::LN_2),
            )),
            HlOp::Log10 => Ok(LoweredCall::Replace(
                self.log_scaled(args[0], ret, core::f64::consts::LOG10_2),
            )),
            HlOp::Pow => {
                let ty = self.module.ty_of(args[0]);
                let l = scalarize::emit_elementwise(self, HwOp::Log, ty, ty, &[args[0]]);
                let m = self.emit(
                    ty,
                    Instr::Binary {
                        op: BinOp::FMul,
                        lhs: l,
                        rhs: args[1],
                    },
                );
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self,
                    HwOp::Exp,
                    ret,
                    ty,
                    &[m],
                )))
            }

            HlOp::Abs => Ok(LoweredCall::Replace(self.lower_abs(ret, args[0]))),
            HlOp::Min | HlOp::Max => {
                let s = self.scalar_kind(args[0]);
                let hw = if op == HlOp::Min {
                    pick_signed(s, HwOp::FMin, HwOp::IMin, HwOp::UMin)
                } else {
                    pick_signed(s, HwOp::FMax, HwOp::IMax, HwOp::UMax)
                };
                let ty = self.module.ty_of(args[0]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self, hw, ret, ty, args,
                )))
            }
            HlOp::Mad => {
                let s = self.scalar_kind(args[0]);
                let hw = pick_signed(s, HwOp::FMad, HwOp::IMad, HwOp::UMad);
                let ty = self.module.ty_of(args[0]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self, hw, ret, ty, args,
                )))
            }
            HlOp::Lerp => {
                let ty = self.module.ty_of(args[0]);
                let d = self.emit(
                    ty,
                    Instr::Binary {
                        op: BinOp::FSub,
                        lhs: args[1],
                        rhs: args[0],
                    },
                );
                let sd = self.emit(
                    ty,
                    Instr::Binary {
                        op: BinOp::FMul,
                        lhs: args[2],
                        rhs: d,
                    },
                );
                Ok(LoweredCall::Replace(self.emit(
                    ret,
                    Instr::Binary {
                        op: BinOp::FAdd,
                        lhs: args[0],
                        rhs: sd,
                    },
                )))
            }
            HlOp::Clamp => {
                let s = self.scalar_kind(args[0]);
                let (maxop, minop) = (
                    pick_signed(s, HwOp::FMax, HwOp::IMax, HwOp::UMax),
                    pick_signed(s, HwOp::FMin, HwOp::IMin, HwOp::UMin),
                );
                let ty = self.module.ty_of(args[0]);
                let lo = scalarize::emit_elementwise(self, maxop, ty, ty, &[args[0], args[1]]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self,
                    minop,
                    ret,
                    ty,
                    &[lo, args[2]],
                )))
            }

            // geometry
            HlOp::Dot => self.lower_dot(ret, args[0], args[1]),
            HlOp::Cross => Ok(LoweredCall::Replace(self.lower_cross(ret, args[0], args[1]))),
            HlOp::Length => {
                let len = self.vec_length(args[0]);
                Ok(LoweredCall::Replace(len))
            }
            HlOp::Normalize => {
                let ty = self.module.ty_of(args[0]);
                let len = self.vec_length(args[0]);
                let s = self.splat(ty, len);
                Ok(LoweredCall::Replace(self.emit(
                    ret,
                    Instr::Binary {
                        op: BinOp::FDiv,
                        lhs: args[0],
                        rhs: s,
                    },
                )))
            }
            HlOp::Distance => {
                let ty = self.module.ty_of(args[0]);
                let d = self.emit(
                    ty,
                    Instr::Binary {
                        op: BinOp::FSub,
                        lhs: args[0],
                        rhs: args[1],
                    },
                );
                Ok(LoweredCall::Replace(self.vec_length(d)))
            }
            HlOp::Reflect => Ok(LoweredCall::Replace(self.lower_reflect(ret, args[0], args[1]))),
            HlOp::Fwidth => {
                let ty = self.module.ty_of(args[0]);
                let dx = scalarize::emit_elementwise(self, HwOp::DerivCoarseX, ty, ty, &[args[0]]);
                let ax = scalarize::emit_elementwise(self, HwOp::FAbs, ty, ty, &[dx]);
                let dy = scalarize::emit_elementwise(self, HwOp::DerivCoarseY, ty, ty, &[args[0]]);
                let ay = scalarize::emit_elementwise(self, HwOp::FAbs, ty, ty, &[dy]);
                Ok(LoweredCall::Replace(self.emit(
                    ret,
                    Instr::Binary {
                        op: BinOp::FAdd,
                        lhs: ax,
                        rhs: ay,
                    },
                )))
            }

            // reinterpret casts
            HlOp::Asfloat | HlOp::Asint | HlOp::Asuint => Ok(LoweredCall::Replace(self.emit(
                ret,
                Instr::Cast {
                    op: CastOp::BitCast,
                    value: args[0],
                },
            ))),

            HlOp::Pack4x8 => {
                let w = self.width_of(args[0]);
                if w != 4 {
                    let p = self.poison_with(ret, "pack operation requires a 4-component vector");
                    return Ok(LoweredCall::Replace(p));
                }
                let lanes = self.explode(args[0]);
                Ok(LoweredCall::Replace(self.emit_hw(HwOp::Pack4x8, ret, &lanes)))
            }
            HlOp::Unpack4x8 => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::Unpack4x8, ret, args),
            )),

            HlOp::AddUint64 => self.lower_add_uint64(ret, args[0], args[1]),

            // resource handles survive this stage; the binding pass consumes them
            HlOp::CreateHandle | HlOp::AnnotateHandle => Ok(LoweredCall::Keep),

            HlOp::Subscript => buffer::lower_subscript(self, site, args[0], args[1]),
            HlOp::CBufSubscript => buffer::lower_cbuf_subscript(self, site, args[0]),
            HlOp::BufferLoad => buffer::lower_buffer_load(self, ret, args[0], args[1]),
            HlOp::BufferStore => buffer::lower_buffer_store(self, args[0], args[1], args[2]),
            HlOp::GetDimensions => {
                let props = self.resources.resolve(self.module, args[0], self.diags)?;
                if !props.is_valid() {
                    let bound = self
                        .resources
                        .bound_symbol(self.module, args[0])
                        .map(|g| self.module.globals[g.0 as usize].name);
                    let msg = match bound {
                        Some(n) => format!("cannot query the dimensions of '{n}'"),
                        None => "cannot query dimensions of this resource".to_owned(),
                    };
                    let p = self.poison_with(ret, msg);
                    return Ok(LoweredCall::Replace(p));
                }
                // the hardware query always yields four 32-bit components;
                // only the kind-dependent prefix carries meaning (buffers one
                // element count, textures their coordinate extents plus the
                // trailing mip count)
                let avail = if props.kind.is_buffer() {
                    1
                } else {
                    (props.kind.coord_dims() + 1).min(4)
                };
                let w = self.module.types.vector_width(ret).unwrap_or(1);
                if w > avail {
                    let p = self.poison_with(
                        ret,
                        format!("this resource kind has {avail} dimension components"),
                    );
                    return Ok(LoweredCall::Replace(p));
                }
                let u32x4 = self.module.types.vector(ScalarType::UInt32, 4);
                let sty = match *self.module.types.data(ret) {
                    TypeData::Vector(s, _) => self.module.types.scalar(s),
                    _ => ret,
                };
                let call = self.emit_hw(HwOp::GetDimensions, u32x4, &[args[0], args[1]]);
                let mut lanes: SmallVec<[ValueRef; 4]> = SmallVec::new();
                for lane in 0..w {
                    lanes.push(self.emit(sty, Instr::ExtractElement { vector: call, lane }));
                }
                let v = if w == 1 {
                    lanes[0]
                } else {
                    self.build_vector(ret, &lanes)
                };
                Ok(LoweredCall::Replace(v))
            }
            HlOp::UpdateCounter => {
                self.resources.mark_has_counter(self.module, args[0], self.diags)?;
                Ok(LoweredCall::Replace(
                    self.emit_hw(HwOp::UpdateCounter, ret, args),
                ))
            }

            // matrix memory accesses not rooted in a resource subscript; the
            // in-buffer forms were already consumed by the subscript walk
            HlOp::MatSubscript | HlOp::MatLoad | HlOp::MatStore => {
                matrix::lower_orphan_access(self, ret)
            }

            // texture access: shapes are already hardware-shaped, only the
            // opcode and the store value layout change
            HlOp::Sample
            | HlOp::SampleLevel
            | HlOp::SampleGrad
            | HlOp::SampleBias
            | HlOp::SampleCmp
            | HlOp::SampleCmpLevelZero
            | HlOp::TexLoad => {
                let props = self.resources.resolve(self.module, args[0], self.diags)?;
                if !props.is_valid() {
                    let p = self.poison_with(ret, "cannot map resource to handle");
                    return Ok(LoweredCall::Replace(p));
                }
                let hw = match op {
                    HlOp::Sample => HwOp::Sample,
                    HlOp::SampleLevel => HwOp::SampleLevel,
                    HlOp::SampleGrad => HwOp::SampleGrad,
                    HlOp::SampleBias => HwOp::SampleBias,
                    HlOp::SampleCmp => HwOp::SampleCmp,
                    HlOp::SampleCmpLevelZero => HwOp::SampleCmpLevelZero,
                    _ => HwOp::TextureLoad,
                };
                Ok(LoweredCall::Replace(self.emit_hw(hw, ret, args)))
            }
            HlOp::TexStore => self.lower_tex_store(args),
            HlOp::CheckAccessFullyMapped => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::CheckAccessFullyMapped, ret, args),
            )),

            // interlocked forms reaching dispatch directly target memory
            // pointers; resource-subscript forms were consumed earlier
            HlOp::InterlockedAdd => atomic::lower_interlocked(self, args, AtomicKind::Add),
            HlOp::InterlockedAnd => atomic::lower_interlocked(self, args, AtomicKind::And),
            HlOp::InterlockedOr => atomic::lower_interlocked(self, args, AtomicKind::Or),
            HlOp::InterlockedXor => atomic::lower_interlocked(self, args, AtomicKind::Xor),
            HlOp::InterlockedMin => {
                let s = self.scalar_kind(args[1]);
                let k = if s.is_signed_int() { AtomicKind::IMin } else { AtomicKind::UMin };
                atomic::lower_interlocked(self, args, k)
            }
            HlOp::InterlockedMax => {
                let s = self.scalar_kind(args[1]);
                let k = if s.is_signed_int() { AtomicKind::IMax } else { AtomicKind::UMax };
                atomic::lower_interlocked(self, args, k)
            }
            HlOp::InterlockedUMin => atomic::lower_interlocked(self, args, AtomicKind::UMin),
            HlOp::InterlockedUMax => atomic::lower_interlocked(self, args, AtomicKind::UMax),
            HlOp::InterlockedExchange => {
                atomic::lower_interlocked(self, args, AtomicKind::Exchange)
            }
            HlOp::InterlockedCompareExchange => atomic::lower_cmpxchg(self, args, true),
            HlOp::InterlockedCompareStore => atomic::lower_cmpxchg(self, args, false),

            // wave intrinsics
            HlOp::WaveGetLaneCount => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WaveGetLaneCount, ret, &[]),
            )),
            HlOp::WaveGetLaneIndex => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WaveGetLaneIndex, ret, &[]),
            )),
            HlOp::WaveIsFirstLane => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WaveIsFirstLane, ret, &[]),
            )),
            HlOp::WaveReadLaneAt => {
                let ty = self.module.ty_of(args[0]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self,
                    HwOp::WaveReadLaneAt,
                    ret,
                    ty,
                    args,
                )))
            }
            HlOp::WaveReadLaneFirst => {
                let ty = self.module.ty_of(args[0]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self,
                    HwOp::WaveReadLaneFirst,
                    ret,
                    ty,
                    args,
                )))
            }
            HlOp::WaveActiveAnyTrue => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WaveAnyTrue, ret, args),
            )),
            HlOp::WaveActiveAllTrue => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WaveAllTrue, ret, args),
            )),
            HlOp::WaveActiveBallot => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WaveActiveBallot, ret, args),
            )),
            HlOp::WaveActiveSum => self.lower_wave_op(ret, args[0], WaveOpKind::Sum),
            HlOp::WaveActiveProduct => self.lower_wave_op(ret, args[0], WaveOpKind::Product),
            HlOp::WaveActiveMin => self.lower_wave_op(ret, args[0], WaveOpKind::Min),
            HlOp::WaveActiveMax => self.lower_wave_op(ret, args[0], WaveOpKind::Max),
            HlOp::WaveActiveBitAnd => self.lower_wave_bit(ret, args[0], WaveBitKind::And),
            HlOp::WaveActiveBitOr => self.lower_wave_bit(ret, args[0], WaveBitKind::Or),
            HlOp::WaveActiveBitXor => self.lower_wave_bit(ret, args[0], WaveBitKind::Xor),
            HlOp::WavePrefixSum => self.lower_wave_prefix(ret, args[0], WaveOpKind::Sum),
            HlOp::WavePrefixProduct => self.lower_wave_prefix(ret, args[0], WaveOpKind::Product),
            HlOp::WavePrefixCountBits => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::WavePrefixCountBits, ret, args),
            )),

            HlOp::QuadReadAcrossX => self.lower_quad(ret, args[0], QuadOpKind::ReadAcrossX),
            HlOp::QuadReadAcrossY => self.lower_quad(ret, args[0], QuadOpKind::ReadAcrossY),
            HlOp::QuadReadAcrossDiagonal => {
                self.lower_quad(ret, args[0], QuadOpKind::ReadAcrossDiagonal)
            }
            HlOp::QuadReadLaneAt => {
                let ty = self.module.ty_of(args[0]);
                Ok(LoweredCall::Replace(scalarize::emit_elementwise(
                    self,
                    HwOp::QuadReadLaneAt,
                    ret,
                    ty,
                    args,
                )))
            }

            // barriers
            HlOp::AllMemoryBarrier => {
                self.lower_barrier(BarrierMode::UAV_FENCE_GLOBAL | BarrierMode::TGSM_FENCE)
            }
            HlOp::AllMemoryBarrierWithGroupSync => self.lower_barrier(
                BarrierMode::UAV_FENCE_GLOBAL
                    | BarrierMode::TGSM_FENCE
                    | BarrierMode::SYNC_THREAD_GROUP,
            ),
            HlOp::DeviceMemoryBarrier => self.lower_barrier(BarrierMode::UAV_FENCE_GLOBAL),
            HlOp::DeviceMemoryBarrierWithGroupSync => self.lower_barrier(
                BarrierMode::UAV_FENCE_GLOBAL | BarrierMode::SYNC_THREAD_GROUP,
            ),
            HlOp::GroupMemoryBarrier => self.lower_barrier(BarrierMode::TGSM_FENCE),
            HlOp::GroupMemoryBarrierWithGroupSync => {
                self.lower_barrier(BarrierMode::TGSM_FENCE | BarrierMode::SYNC_THREAD_GROUP)
            }

            // system value queries
            HlOp::ThreadId => Ok(LoweredCall::Replace(self.emit_hw(HwOp::ThreadId, ret, args))),
            HlOp::GroupId => Ok(LoweredCall::Replace(self.emit_hw(HwOp::GroupId, ret, args))),
            HlOp::ThreadIdInGroup => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::ThreadIdInGroup, ret, args),
            )),
            HlOp::FlattenedThreadIdInGroup => Ok(LoweredCall::Replace(
                self.emit_hw(HwOp::FlattenedThreadIdInGroup, ret, &[]),
            )),

            // ray tracing
            HlOp::TraceRay => {
                self.emit_hw(HwOp::TraceRay, ret, args);
                Ok(LoweredCall::EraseOnly)
            }
            HlOp::ReportHit => Ok(LoweredCall::Replace(self.emit_hw(HwOp::ReportHit, ret, args))),
            HlOp::CallShader => {
                self.emit_hw(HwOp::CallShader, ret, args);
                Ok(LoweredCall::EraseOnly)
            }
            HlOp::IgnoreHit => {
                self.emit_hw(HwOp::IgnoreHit, ret, &[]);
                Ok(LoweredCall::EraseOnly)
            }
            HlOp::AcceptHitAndEndSearch => {
                self.emit_hw(HwOp::AcceptHitAndEndSearch, ret, &[]);
                Ok(LoweredCall::EraseOnly)
            }

            // mesh shaders
            HlOp::SetMeshOutputCounts => {
                self.emit_hw(HwOp::SetMeshOutputCounts, ret, args);
                Ok(LoweredCall::EraseOnly)
            }
            HlOp::DispatchMesh => {
                self.emit_hw(HwOp::DispatchMesh, ret, args);
                Ok(LoweredCall::EraseOnly)
            }

            // final form depends on the output signature, which the signature
            // legalization pass owns
            HlOp::EmitStream | HlOp::CutStream => Ok(LoweredCall::Keep),

            HlOp::Printf | HlOp::SampleProj => {
                self.diags.report(Diag::error(
                    self.loc,
                    format!("operation not supported on this target: {}", op.name()),
                ));
                Ok(LoweredCall::Keep)
            }
        }
    }

    // ---- individual lowerings ----

    fn scalar_kind(&self, v: ValueRef) -> ScalarType {
        self.module
            .types
            .scalar_of(self.module.ty_of(v))
            .unwrap_or(ScalarType::Float)
    }

    fn width_of(&self, v: ValueRef) -> u32 {
        self.module
            .types
            .vector_width(self.module.ty_of(v))
            .unwrap_or(1)
    }

    fn log_scaled(&mut self, x: ValueRef, ret: TypeRef, scale: f64) -> ValueRef {
        let ty = self.module.ty_of(x);
        let l = scalarize::emit_elementwise(self, HwOp::Log, ty, ty, &[x]);
        let s = self.splat_float(ty, scale);
        self.emit(
            ret,
            Instr::Binary {
                op: BinOp::FMul,
                lhs: l,
                rhs: s,
            },
        )
    }

    fn lower_abs(&mut self, ret: TypeRef, x: ValueRef) -> ValueRef {
        let ty = self.module.ty_of(x);
        let s = self.scalar_kind(x);
        if s.is_float() {
            return scalarize::emit_elementwise(self, HwOp::FAbs, ret, ty, &[x]);
        }
        let zero = self.module.const_value(ty, Constant::Int(0));
        let neg = self.emit(
            ty,
            Instr::Binary {
                op: BinOp::Sub,
                lhs: zero,
                rhs: x,
            },
        );
        scalarize::emit_elementwise(self, HwOp::IMax, ret, ty, &[x, neg])
    }

    /// Flattened-lane dot product, one call for widths 2 through 4.
    fn dot_value(&mut self, a: ValueRef, b: ValueRef) -> Option<ValueRef> {
        let w = self.width_of(a);
        let s = self.scalar_kind(a);
        let sty = self.module.types.scalar(s);
        match w {
            1 => Some(self.emit(
                sty,
                Instr::Binary {
                    op: BinOp::FMul,
                    lhs: a,
                    rhs: b,
                },
            )),
            2..=4 => {
                let hw = match w {
                    2 => HwOp::Dot2,
                    3 => HwOp::Dot3,
                    _ => HwOp::Dot4,
                };
                let mut lanes = self.explode(a);
                lanes.extend(self.explode(b));
                Some(self.emit_hw(hw, sty, &lanes))
            }
            _ => None,
        }
    }

    fn lower_dot(
        &mut self,
        ret: TypeRef,
        a: ValueRef,
        b: ValueRef,
    ) -> Result<LoweredCall, InvariantViolation> {
        match self.dot_value(a, b) {
            Some(v) => Ok(LoweredCall::Replace(v)),
            None => {
                let p = self.poison_with(ret, "dot product requires a 1 to 4 component vector");
                Ok(LoweredCall::Replace(p))
            }
        }
    }

    fn vec_length(&mut self, v: ValueRef) -> ValueRef {
        let s = self.scalar_kind(v);
        let sty = self.module.types.scalar(s);
        match self.dot_value(v, v) {
            Some(d) => self.emit_hw(HwOp::Sqrt, sty, &[d]),
            None => self.poison_with(sty, "length requires a 1 to 4 component vector"),
        }
    }

    fn lower_cross(&mut self, ret: TypeRef, a: ValueRef, b: ValueRef) -> ValueRef {
        let s = self.scalar_kind(a);
        let sty = self.module.types.scalar(s);
        let la = self.explode(a);
        let lb = self.explode(b);
        if la.len() != 3 || lb.len() != 3 {
            return self.poison_with(ret, "cross product requires 3-component vectors");
        }
        let mut lanes = SmallVec::<[ValueRef; 4]>::new();
        for i in 0..3usize {
            let (j, k) = ((i + 1) % 3, (i + 2) % 3);
            let p0 = self.emit(
                sty,
                Instr::Binary {
                    op: BinOp::FMul,
                    lhs: la[j],
                    rhs: lb[k],
                },
            );
            let p1 = self.emit(
                sty,
                Instr::Binary {
                    op: BinOp::FMul,
                    lhs: la[k],
                    rhs: lb[j],
                },
            );
            lanes.push(self.emit(
                sty,
                Instr::Binary {
                    op: BinOp::FSub,
                    lhs: p0,
                    rhs: p1,
                },
            ));
        }
        self.build_vector(ret, &lanes)
    }

    fn lower_reflect(&mut self, ret: TypeRef, i: ValueRef, n: ValueRef) -> ValueRef {
        let ty = self.module.ty_of(i);
        let s = self.scalar_kind(i);
        let sty = self.module.types.scalar(s);
        let Some(d) = self.dot_value(i, n) else {
            return self.poison_with(ret, "reflect requires a 1 to 4 component vector");
        };
        let two = self.const_float(s, 2.0);
        let d2 = self.emit(
            sty,
            Instr::Binary {
                op: BinOp::FMul,
                lhs: d,
                rhs: two,
            },
        );
        let d2v = self.splat(ty, d2);
        let proj = self.emit(
            ty,
            Instr::Binary {
                op: BinOp::FMul,
                lhs: d2v,
                rhs: n,
            },
        );
        self.emit(
            ret,
            Instr::Binary {
                op: BinOp::FSub,
                lhs: i,
                rhs: proj,
            },
        )
    }

    /// Paired-uint 64-bit addition: each (lo, hi) lane pair gets a 32-bit low
    /// add, an unsigned-wrap carry, and the carry zero-extended into the high
    /// add. Pairs are processed in ascending lane order.
    fn lower_add_uint64(
        &mut self,
        ret: TypeRef,
        a: ValueRef,
        b: ValueRef,
    ) -> Result<LoweredCall, InvariantViolation> {
        let w = self.width_of(a);
        if w != 2 && w != 4 {
            let p = self.poison_with(
                ret,
                "64-bit add requires a 2 or 4 component unsigned vector",
            );
            return Ok(LoweredCall::Replace(p));
        }
        let u32ty = self.module.types.scalar(ScalarType::UInt32);
        let bty = self.module.types.scalar(ScalarType::Bool);
        let la = self.explode(a);
        let lb = self.explode(b);
        let mut result = self.module.undef(ret);
        for pair in 0..(w as usize / 2) {
            let (lo, hi) = (2 * pair, 2 * pair + 1);
            let sum_lo = self.emit(
                u32ty,
                Instr::Binary {
                    op: BinOp::Add,
                    lhs: la[lo],
                    rhs: lb[lo],
                },
            );
            let wrapped = self.emit(
                bty,
                Instr::Cmp {
                    op: CmpOp::ULt,
                    lhs: sum_lo,
                    rhs: la[lo],
                },
            );
            let carry = self.emit(
                u32ty,
                Instr::Cast {
                    op: CastOp::ZExt,
                    value: wrapped,
                },
            );
            let hi_sum = self.emit(
                u32ty,
                Instr::Binary {
                    op: BinOp::Add,
                    lhs: la[hi],
                    rhs: lb[hi],
                },
            );
            let sum_hi = self.emit(
                u32ty,
                Instr::Binary {
                    op: BinOp::Add,
                    lhs: hi_sum,
                    rhs: carry,
                },
            );
            result = self.emit(
                ret,
                Instr::InsertElement {
                    vector: result,
                    value: sum_lo,
                    lane: lo as u32,
                },
            );
            result = self.emit(
                ret,
                Instr::InsertElement {
                    vector: result,
                    value: sum_hi,
                    lane: hi as u32,
                },
            );
        }
        Ok(LoweredCall::Replace(result))
    }

    fn lower_tex_store(&mut self, args: &[ValueRef]) -> Result<LoweredCall, InvariantViolation> {
        let Some((&value, rest)) = args.split_last() else {
            return Err(InvariantViolation::MalformedCall(
                "texture store without a value operand".into(),
            ));
        };
        let lanes = self.explode(value);
        let mask = crate::hwop::ComponentMask::first(lanes.len() as u32);
        let undef = {
            let s = self.scalar_kind(value);
            let sty = self.module.types.scalar(s);
            self.module.undef(sty)
        };
        let mut full: SmallVec<[ValueRef; 8]> = SmallVec::from_slice(rest);
        for i in 0..4 {
            full.push(*lanes.get(i).unwrap_or(&undef));
        }
        full.push(self.module.const_u32(mask.bits() as u32));
        let void = self.module.types.void();
        self.emit_hw(HwOp::TextureStore, void, &full);
        Ok(LoweredCall::EraseOnly)
    }

    fn lower_wave_op(
        &mut self,
        ret: TypeRef,
        v: ValueRef,
        kind: WaveOpKind,
    ) -> Result<LoweredCall, InvariantViolation> {
        let ty = self.module.ty_of(v);
        let s = self.scalar_kind(v);
        let k = self.module.const_u32(kind as u32);
        let sgn = self.module.const_u32(s.is_signed_int() as u32);
        Ok(LoweredCall::Replace(scalarize::emit_elementwise(
            self,
            HwOp::WaveActiveOp,
            ret,
            ty,
            &[v, k, sgn],
        )))
    }

    fn lower_wave_bit(
        &mut self,
        ret: TypeRef,
        v: ValueRef,
        kind: WaveBitKind,
    ) -> Result<LoweredCall, InvariantViolation> {
        let ty = self.module.ty_of(v);
        let k = self.module.const_u32(kind as u32);
        Ok(LoweredCall::Replace(scalarize::emit_elementwise(
            self,
            HwOp::WaveActiveBit,
            ret,
            ty,
            &[v, k],
        )))
    }

    fn lower_wave_prefix(
        &mut self,
        ret: TypeRef,
        v: ValueRef,
        kind: WaveOpKind,
    ) -> Result<LoweredCall, InvariantViolation> {
        let ty = self.module.ty_of(v);
        let s = self.scalar_kind(v);
        let k = self.module.const_u32(kind as u32);
        let sgn = self.module.const_u32(s.is_signed_int() as u32);
        Ok(LoweredCall::Replace(scalarize::emit_elementwise(
            self,
            HwOp::WavePrefixOp,
            ret,
            ty,
            &[v, k, sgn],
        )))
    }

    fn lower_quad(
        &mut self,
        ret: TypeRef,
        v: ValueRef,
        kind: QuadOpKind,
    ) -> Result<LoweredCall, InvariantViolation> {
        let ty = self.module.ty_of(v);
        let k = self.module.const_u32(kind as u32);
        Ok(LoweredCall::Replace(scalarize::emit_elementwise(
            self,
            HwOp::QuadOp,
            ret,
            ty,
            &[v, k],
        )))
    }

    fn lower_barrier(&mut self, mode: BarrierMode) -> Result<LoweredCall, InvariantViolation> {
        let void = self.module.types.void();
        let m = self.module.const_u32(mode.bits());
        self.emit_hw(HwOp::Barrier, void, &[m]);
        Ok(LoweredCall::EraseOnly)
    }
}

const fn pick_signed(s: ScalarType, f: HwOp, i: HwOp, u: HwOp) -> HwOp {
    if s.is_float() {
        f
    } else if s.is_signed_int() {
        i
    } else {
        u
    }
}

fn direct_elementwise_target(op: HlOp) -> HwOp {
    match op {
        HlOp::Acos => HwOp::Acos,
        HlOp::Asin => HwOp::Asin,
        HlOp::Atan => HwOp::Atan,
        HlOp::Cos => HwOp::Cos,
        HlOp::Sin => HwOp::Sin,
        HlOp::Tan => HwOp::Tan,
        HlOp::Cosh => HwOp::Hcos,
        HlOp::Sinh => HwOp::Hsin,
        HlOp::Tanh => HwOp::Htan,
        HlOp::Exp2 => HwOp::Exp,
        HlOp::Log2 => HwOp::Log,
        HlOp::Sqrt => HwOp::Sqrt,
        HlOp::Rsqrt => HwOp::Rsqrt,
        HlOp::Frac => HwOp::Frc,
        HlOp::Round => HwOp::RoundNe,
        HlOp::Floor => HwOp::RoundNi,
        HlOp::Ceil => HwOp::RoundPi,
        HlOp::Truncate => HwOp::RoundZ,
        HlOp::IsNan => HwOp::IsNaN,
        HlOp::IsInf => HwOp::IsInf,
        HlOp::IsFinite => HwOp::IsFinite,
        HlOp::Saturate => HwOp::Saturate,
        HlOp::Countbits => HwOp::Countbits,
        HlOp::Reversebits => HwOp::Bfrev,
        HlOp::FirstbitHi => HwOp::FirstbitHi,
        HlOp::FirstbitLo => HwOp::FirstbitLo,
        HlOp::FirstbitSHi => HwOp::FirstbitSHi,
        HlOp::DdxCoarse => HwOp::DerivCoarseX,
        HlOp::DdxFine => HwOp::DerivFineX,
        HlOp::DdyCoarse => HwOp::DerivCoarseY,
        HlOp::DdyFine => HwOp::DerivFineY,
        HlOp::F16ToF32 => HwOp::LegacyF16ToF32,
        HlOp::F32ToF16 => HwOp::LegacyF32ToF16,
        other => unreachable!("no direct elementwise target for {other:?}"),
    }
}

/// Runs the whole lowering over `module`. User-facing problems land in
/// `diags`; only internal invariant violations abort the run.
pub fn lower_module<'s>(
    module: &mut Module<'s>,
    target: &Target,
    diags: &mut DiagSink,
) -> Result<LowerOutput, InvariantViolation> {
    let mut ctx = LowerCtx::new(
        module,
        target,
        diags,
        Cursor {
            func: FuncRef(0),
            at: 0,
        },
        SourceLoc::UNKNOWN,
    );
    ctx.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueData;
    use smallvec::smallvec;

    fn hl1(m: &mut Module<'_>, f: FuncRef, op: HlOp, ret: TypeRef, args: &[ValueRef]) -> ValueRef {
        m.push_instr(
            f,
            ret,
            Instr::HlCall {
                op,
                args: SmallVec::from_slice(args),
            },
            SourceLoc::UNKNOWN,
        )
    }

    fn body_hw_ops(m: &Module<'_>, f: FuncRef) -> Vec<HwOp> {
        m.func(f)
            .body
            .iter()
            .filter_map(|&v| match m.instr(v) {
                Some(Instr::HwCall { op, .. }) => Some(*op),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sin_call_becomes_hardware_call_with_opcode_constant() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let fty = m.types.scalar(ScalarType::Float);
        let x = m.undef(fty);
        let site = hl1(&mut m, f, HlOp::Sin, fty, &[x]);
        // keep the result alive
        let keep = m.push_instr(
            f,
            fty,
            Instr::Binary {
                op: BinOp::FAdd,
                lhs: site,
                rhs: site,
            },
            SourceLoc::UNKNOWN,
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();

        assert!(m.is_erased(site));
        assert!(diags.is_empty());
        let Some(Instr::Binary { lhs, .. }) = m.instr(keep) else {
            unreachable!()
        };
        let Some(Instr::HwCall { op, args }) = m.instr(*lhs) else {
            panic!("replacement is not a hardware call");
        };
        assert_eq!(*op, HwOp::Sin);
        assert_eq!(m.const_int_value(args[0]), Some(HwOp::Sin.code() as i64));
    }

    #[test]
    fn natural_exp_scales_by_log2_e() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let fty = m.types.scalar(ScalarType::Float);
        let x = m.undef(fty);
        let site = hl1(&mut m, f, HlOp::Exp, fty, &[x]);
        m.push_instr(
            f,
            fty,
            Instr::Binary {
                op: BinOp::FAdd,
                lhs: site,
                rhs: site,
            },
            SourceLoc::UNKNOWN,
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();

        let body = m.func(f).body.clone();
        let mul_then_exp: Vec<&str> = body
            .iter()
            .filter_map(|&v| match m.instr(v) {
                Some(Instr::Binary { op: BinOp::FMul, rhs, .. }) => {
                    match m.as_const(*rhs) {
                        Some(Constant::FloatBits(b))
                            if b == (core::f64::consts::LOG2_E as f32).to_bits() as u64 =>
                        {
                            Some("scale")
                        }
                        _ => None,
                    }
                }
                Some(Instr::HwCall { op: HwOp::Exp, .. }) => Some("exp2"),
                _ => None,
            })
            .collect();
        assert_eq!(mul_then_exp, vec!["scale", "exp2"]);
    }

    #[test]
    fn paired_uint64_add_chains_carry_per_lane_pair() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let u4 = m.types.vector(ScalarType::UInt32, 4);
        let a = m.undef(u4);
        let b = m.undef(u4);
        let site = hl1(&mut m, f, HlOp::AddUint64, u4, &[a, b]);
        m.push_instr(
            f,
            u4,
            Instr::Binary {
                op: BinOp::Xor,
                lhs: site,
                rhs: site,
            },
            SourceLoc::UNKNOWN,
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();
        assert!(diags.is_empty());

        // two lane pairs, each with one wrap compare and one carry zext
        let body = m.func(f).body.clone();
        let carries = body
            .iter()
            .filter(|&&v| matches!(m.instr(v), Some(Instr::Cmp { op: CmpOp::ULt, .. })))
            .count();
        assert_eq!(carries, 2);
        // inserts happen in ascending lane order
        let lanes: Vec<u32> = body
            .iter()
            .filter_map(|&v| match m.instr(v) {
                Some(Instr::InsertElement { lane, .. }) => Some(*lane),
                _ => None,
            })
            .collect();
        assert_eq!(lanes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn group_barrier_carries_fence_and_sync_flags() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        hl1(
            &mut m,
            f,
            HlOp::GroupMemoryBarrierWithGroupSync,
            void,
            &[],
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();

        let body = m.func(f).body.clone();
        let mode = body.iter().find_map(|&v| match m.instr(v) {
            Some(Instr::HwCall { op: HwOp::Barrier, args }) => m.const_int_value(args[1]),
            _ => None,
        });
        let expect = BarrierMode::TGSM_FENCE | BarrierMode::SYNC_THREAD_GROUP;
        assert_eq!(mode, Some(expect.bits() as i64));
    }

    #[test]
    fn dot3_flattens_both_operands_into_one_call() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let f3 = m.types.vector(ScalarType::Float, 3);
        let fty = m.types.scalar(ScalarType::Float);
        let a = m.undef(f3);
        let b = m.undef(f3);
        let site = hl1(&mut m, f, HlOp::Dot, fty, &[a, b]);
        m.push_instr(
            f,
            fty,
            Instr::Binary {
                op: BinOp::FAdd,
                lhs: site,
                rhs: site,
            },
            SourceLoc::UNKNOWN,
        );

        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();
        let ops = body_hw_ops(&m, f);
        assert_eq!(ops, vec![HwOp::Dot3]);
    }

    #[test]
    fn unused_poison_stays_silent_but_used_poison_reports() {
        // Pack4x8 of a 2-wide vector is invalid; when the result is unused the
        // deferred diagnostic must not fire.
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let f2 = m.types.vector(ScalarType::Float, 2);
        let u32ty = m.types.scalar(ScalarType::UInt32);
        let x = m.undef(f2);
        hl1(&mut m, f, HlOp::Pack4x8, u32ty, &[x]);
        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();
        assert!(diags.is_empty());

        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let f2 = m.types.vector(ScalarType::Float, 2);
        let u32ty = m.types.scalar(ScalarType::UInt32);
        let x = m.undef(f2);
        let site = hl1(&mut m, f, HlOp::Pack4x8, u32ty, &[x]);
        m.push_instr(
            f,
            u32ty,
            Instr::Binary {
                op: BinOp::Add,
                lhs: site,
                rhs: site,
            },
            SourceLoc::UNKNOWN,
        );
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();
        assert!(diags.has_errors());
    }

    #[test]
    fn unsupported_printf_reports_and_keeps_the_call() {
        let mut m = Module::new();
        let void = m.types.void();
        let f = m.define_function("t", Vec::new(), void);
        let site = hl1(&mut m, f, HlOp::Printf, void, &[]);
        let target = Target::default();
        let mut diags = DiagSink::new();
        lower_module(&mut m, &target, &mut diags).unwrap();
        assert!(diags.has_errors());
        assert!(!m.is_erased(site));
        assert!(matches!(
            m.value(site),
            ValueData::Instr {
                instr: Instr::HlCall { op: HlOp::Printf, .. },
                ..
            }
        ));
    }
}
