use std::collections::HashMap;
use std::fmt::Write;

use smallvec::SmallVec;

use crate::concrete_type::{AddrSpace, TypeContext, TypeData, TypeRef};
use crate::hlop::HlOp;
use crate::hwop::{AtomicKind, HwOp};
use crate::source_loc::SourceLoc;

use super::{FuncRef, GlobalId, ValueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Undef,
    /// Placeholder for a value whose computation was rejected; paired with a
    /// deferred diagnostic by the lowering driver.
    Poison,
    Bool(bool),
    Int(i64),
    /// Raw bit pattern; the value's type decides the width.
    FloatBits(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    ULt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    BitCast,
    AddrSpaceCast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessStepKind {
    /// Step through the pointer itself (leading zero index).
    Deref,
    Struct,
    Array,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessStep {
    pub kind: AccessStepKind,
    pub index: ValueRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    HlCall {
        op: HlOp,
        args: SmallVec<[ValueRef; 4]>,
    },
    HwCall {
        op: HwOp,
        args: SmallVec<[ValueRef; 4]>,
    },
    Binary {
        op: BinOp,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Cmp {
        op: CmpOp,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Cast {
        op: CastOp,
        value: ValueRef,
    },
    ExtractElement {
        vector: ValueRef,
        lane: u32,
    },
    InsertElement {
        vector: ValueRef,
        value: ValueRef,
        lane: u32,
    },
    AccessChain {
        base: ValueRef,
        steps: Vec<AccessStep>,
    },
    Select {
        cond: ValueRef,
        on_true: ValueRef,
        on_false: ValueRef,
    },
    /// Control-flow merge; predecessor block identity is irrelevant to this
    /// stage, only the incoming values are walked.
    Phi(SmallVec<[ValueRef; 2]>),
    Load {
        ptr: ValueRef,
    },
    Store {
        ptr: ValueRef,
        value: ValueRef,
    },
    AtomicRmw {
        op: AtomicKind,
        ptr: ValueRef,
        value: ValueRef,
    },
    AtomicCmpXchg {
        ptr: ValueRef,
        cmp: ValueRef,
        new: ValueRef,
    },
}
impl Instr {
    pub fn for_each_operand(&self, mut f: impl FnMut(ValueRef)) {
        match self {
            Self::HlCall { args, .. } | Self::HwCall { args, .. } => {
                for &a in args {
                    f(a);
                }
            }
            Self::Binary { lhs, rhs, .. } | Self::Cmp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Self::Cast { value, .. } => f(*value),
            Self::ExtractElement { vector, .. } => f(*vector),
            Self::InsertElement { vector, value, .. } => {
                f(*vector);
                f(*value);
            }
            Self::AccessChain { base, steps } => {
                f(*base);
                for s in steps {
                    f(s.index);
                }
            }
            Self::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(*cond);
                f(*on_true);
                f(*on_false);
            }
            Self::Phi(incomings) => {
                for &v in incomings {
                    f(v);
                }
            }
            Self::Load { ptr } => f(*ptr),
            Self::Store { ptr, value } => {
                f(*ptr);
                f(*value);
            }
            Self::AtomicRmw { ptr, value, .. } => {
                f(*ptr);
                f(*value);
            }
            Self::AtomicCmpXchg { ptr, cmp, new } => {
                f(*ptr);
                f(*cmp);
                f(*new);
            }
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueRef)) {
        match self {
            Self::HlCall { args, .. } | Self::HwCall { args, .. } => {
                for a in args.iter_mut() {
                    f(a);
                }
            }
            Self::Binary { lhs, rhs, .. } | Self::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Self::Cast { value, .. } => f(value),
            Self::ExtractElement { vector, .. } => f(vector),
            Self::InsertElement { vector, value, .. } => {
                f(vector);
                f(value);
            }
            Self::AccessChain { base, steps } => {
                f(base);
                for s in steps.iter_mut() {
                    f(&mut s.index);
                }
            }
            Self::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            Self::Phi(incomings) => {
                for v in incomings.iter_mut() {
                    f(v);
                }
            }
            Self::Load { ptr } => f(ptr),
            Self::Store { ptr, value } => {
                f(ptr);
                f(value);
            }
            Self::AtomicRmw { ptr, value, .. } => {
                f(ptr);
                f(value);
            }
            Self::AtomicCmpXchg { ptr, cmp, new } => {
                f(ptr);
                f(cmp);
                f(new);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ValueData {
    Constant {
        ty: TypeRef,
        c: Constant,
    },
    Argument {
        ty: TypeRef,
        func: FuncRef,
        index: u32,
    },
    Global {
        ty: TypeRef,
        id: GlobalId,
    },
    Instr {
        ty: TypeRef,
        instr: Instr,
        loc: SourceLoc,
        owner: FuncRef,
    },
    /// Tombstone; never revisited by the dispatch pass.
    Erased,
}

#[derive(Debug)]
struct ValueEntry {
    data: ValueData,
    uses: Vec<ValueRef>,
}

#[derive(Debug)]
pub struct GlobalDef<'s> {
    pub name: &'s str,
    pub ty: TypeRef,
    pub value: ValueRef,
}

#[derive(Debug)]
pub struct Function<'s> {
    pub name: &'s str,
    pub params: Vec<TypeRef>,
    pub ret: TypeRef,
    pub args: Vec<ValueRef>,
    /// Instruction sequence in execution order.
    pub body: Vec<ValueRef>,
}

/// Insertion point inside a function body, advanced after each emission so a
/// lowering function's output stays in emission order at the original call
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub func: FuncRef,
    pub at: usize,
}

pub struct Module<'s> {
    pub types: TypeContext<'s>,
    values: Vec<ValueEntry>,
    pub globals: Vec<GlobalDef<'s>>,
    pub functions: Vec<Function<'s>>,
    defined_const_map: HashMap<(TypeRef, Constant), ValueRef>,
}
impl<'s> Module<'s> {
    pub fn new() -> Self {
        Self {
            types: TypeContext::new(),
            values: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            defined_const_map: HashMap::new(),
        }
    }

    fn push_value(&mut self, data: ValueData) -> ValueRef {
        let v = ValueRef(self.values.len() as u32);
        if let ValueData::Instr { ref instr, .. } = data {
            let mut operands = SmallVec::<[ValueRef; 8]>::new();
            instr.for_each_operand(|o| operands.push(o));
            for o in operands {
                self.values[o.0 as usize].uses.push(v);
            }
        }
        self.values.push(ValueEntry {
            data,
            uses: Vec::new(),
        });
        v
    }

    #[inline]
    pub fn value(&self, v: ValueRef) -> &ValueData {
        &self.values[v.0 as usize].data
    }

    #[inline]
    pub fn uses(&self, v: ValueRef) -> &[ValueRef] {
        &self.values[v.0 as usize].uses
    }

    #[inline]
    pub fn is_erased(&self, v: ValueRef) -> bool {
        matches!(self.values[v.0 as usize].data, ValueData::Erased)
    }

    pub fn ty_of(&self, v: ValueRef) -> TypeRef {
        match self.values[v.0 as usize].data {
            ValueData::Constant { ty, .. }
            | ValueData::Argument { ty, .. }
            | ValueData::Global { ty, .. }
            | ValueData::Instr { ty, .. } => ty,
            ValueData::Erased => unreachable!("type query on erased value {v:?}"),
        }
    }

    pub fn instr(&self, v: ValueRef) -> Option<&Instr> {
        match self.values[v.0 as usize].data {
            ValueData::Instr { ref instr, .. } => Some(instr),
            _ => None,
        }
    }

    pub fn loc_of(&self, v: ValueRef) -> SourceLoc {
        match self.values[v.0 as usize].data {
            ValueData::Instr { loc, .. } => loc,
            _ => SourceLoc::UNKNOWN,
        }
    }

    pub fn as_const(&self, v: ValueRef) -> Option<Constant> {
        match self.values[v.0 as usize].data {
            ValueData::Constant { c, .. } => Some(c),
            _ => None,
        }
    }

    pub fn const_int_value(&self, v: ValueRef) -> Option<i64> {
        match self.as_const(v)? {
            Constant::Int(x) => Some(x),
            Constant::Bool(b) => Some(b as i64),
            _ => None,
        }
    }

    // ---- constants ----

    pub fn const_value(&mut self, ty: TypeRef, c: Constant) -> ValueRef {
        // poison values stay distinct so each one can carry its own deferred
        // diagnostic
        if matches!(c, Constant::Poison) {
            return self.push_value(ValueData::Constant { ty, c });
        }
        if let Some(&v) = self.defined_const_map.get(&(ty, c)) {
            return v;
        }
        let v = self.push_value(ValueData::Constant { ty, c });
        self.defined_const_map.insert((ty, c), v);
        v
    }

    pub fn const_u32(&mut self, x: u32) -> ValueRef {
        let ty = self.types.scalar(crate::concrete_type::ScalarType::UInt32);
        self.const_value(ty, Constant::Int(x as i64))
    }

    pub fn const_i32(&mut self, x: i32) -> ValueRef {
        let ty = self.types.scalar(crate::concrete_type::ScalarType::SInt32);
        self.const_value(ty, Constant::Int(x as i64))
    }

    pub fn const_bool(&mut self, x: bool) -> ValueRef {
        let ty = self.types.scalar(crate::concrete_type::ScalarType::Bool);
        self.const_value(ty, Constant::Bool(x))
    }

    pub fn const_f32(&mut self, x: f32) -> ValueRef {
        let ty = self.types.scalar(crate::concrete_type::ScalarType::Float);
        self.const_value(ty, Constant::FloatBits(x.to_bits() as u64))
    }

    pub fn const_f64(&mut self, x: f64) -> ValueRef {
        let ty = self.types.scalar(crate::concrete_type::ScalarType::Double);
        self.const_value(ty, Constant::FloatBits(x.to_bits()))
    }

    pub fn undef(&mut self, ty: TypeRef) -> ValueRef {
        self.const_value(ty, Constant::Undef)
    }

    pub fn poison(&mut self, ty: TypeRef) -> ValueRef {
        self.const_value(ty, Constant::Poison)
    }

    // ---- globals / functions ----

    pub fn define_global(&mut self, name: &'s str, ty: TypeRef) -> ValueRef {
        let id = GlobalId(self.globals.len() as u32);
        let value = self.push_value(ValueData::Global { ty, id });
        self.globals.push(GlobalDef { name, ty, value });
        value
    }

    pub fn define_function(&mut self, name: &'s str, params: Vec<TypeRef>, ret: TypeRef) -> FuncRef {
        let func = FuncRef(self.functions.len() as u32);
        let args = params
            .iter()
            .enumerate()
            .map(|(index, &ty)| {
                self.push_value(ValueData::Argument {
                    ty,
                    func,
                    index: index as u32,
                })
            })
            .collect();
        self.functions.push(Function {
            name,
            params,
            ret,
            args,
            body: Vec::new(),
        });
        func
    }

    pub fn func(&self, f: FuncRef) -> &Function<'s> {
        &self.functions[f.0 as usize]
    }

    // ---- instruction emission ----

    pub fn push_instr(&mut self, func: FuncRef, ty: TypeRef, instr: Instr, loc: SourceLoc) -> ValueRef {
        let v = self.push_value(ValueData::Instr {
            ty,
            instr,
            loc,
            owner: func,
        });
        self.functions[func.0 as usize].body.push(v);
        v
    }

    pub fn insert_instr(
        &mut self,
        cursor: &mut Cursor,
        ty: TypeRef,
        instr: Instr,
        loc: SourceLoc,
    ) -> ValueRef {
        let v = self.push_value(ValueData::Instr {
            ty,
            instr,
            loc,
            owner: cursor.func,
        });
        self.functions[cursor.func.0 as usize]
            .body
            .insert(cursor.at, v);
        cursor.at += 1;
        v
    }

    /// Position of a value inside its function body, for cursor setup.
    pub fn position_of(&self, v: ValueRef) -> Option<Cursor> {
        let ValueData::Instr { owner, .. } = self.values[v.0 as usize].data else {
            return None;
        };
        let at = self.functions[owner.0 as usize]
            .body
            .iter()
            .position(|&x| x == v)?;
        Some(Cursor { func: owner, at })
    }

    // ---- graph mutation ----

    /// O(uses) operand rewrite; use list moves to `new`.
    pub fn replace_all_uses(&mut self, old: ValueRef, new: ValueRef) {
        if old == new {
            return;
        }
        let users = core::mem::take(&mut self.values[old.0 as usize].uses);
        for &u in &users {
            if let ValueData::Instr { ref mut instr, .. } = self.values[u.0 as usize].data {
                instr.for_each_operand_mut(|r| {
                    if *r == old {
                        *r = new;
                    }
                });
            }
        }
        self.values[new.0 as usize].uses.extend(users);
    }

    /// Rewrites a single operand slot of a call instruction, keeping use
    /// lists consistent.
    pub fn set_call_operand(&mut self, call: ValueRef, index: usize, new: ValueRef) {
        let old = {
            let ValueData::Instr { ref mut instr, .. } = self.values[call.0 as usize].data else {
                unreachable!("set_call_operand on non-instruction {call:?}");
            };
            match instr {
                Instr::HlCall { args, .. } | Instr::HwCall { args, .. } => {
                    core::mem::replace(&mut args[index], new)
                }
                _ => unreachable!("set_call_operand on non-call {call:?}"),
            }
        };
        if old != new {
            let uses = &mut self.values[old.0 as usize].uses;
            if let Some(p) = uses.iter().position(|&u| u == call) {
                uses.swap_remove(p);
            }
            self.values[new.0 as usize].uses.push(call);
        }
    }

    /// Erases an instruction: operand use edges are dropped, the body slot is
    /// removed, the entry becomes a tombstone. Erasure is the termination
    /// signal for a call site; erasing a value that still has uses is a bug.
    pub fn erase(&mut self, v: ValueRef) {
        debug_assert!(
            self.values[v.0 as usize].uses.is_empty(),
            "erasing {v:?} which still has uses"
        );
        let data = core::mem::replace(&mut self.values[v.0 as usize].data, ValueData::Erased);
        if let ValueData::Instr { instr, owner, .. } = data {
            let mut operands = SmallVec::<[ValueRef; 8]>::new();
            instr.for_each_operand(|o| operands.push(o));
            for o in operands {
                let uses = &mut self.values[o.0 as usize].uses;
                if let Some(p) = uses.iter().position(|&u| u == v) {
                    uses.swap_remove(p);
                }
            }
            let body = &mut self.functions[owner.0 as usize].body;
            if let Some(p) = body.iter().position(|&x| x == v) {
                body.remove(p);
            }
        }
    }

    // ---- dump ----

    pub fn dump_value(&self, v: ValueRef, out: &mut String) {
        match &self.values[v.0 as usize].data {
            ValueData::Constant { ty, c } => {
                let _ = write!(out, "{v:?} = const {ty:?} {c:?}");
            }
            ValueData::Argument { ty, index, .. } => {
                let _ = write!(out, "{v:?} = arg{index} {ty:?}");
            }
            ValueData::Global { ty, id } => {
                let _ = write!(out, "{v:?} = global {id:?} {ty:?}");
            }
            ValueData::Instr { ty, instr, .. } => match instr {
                Instr::HlCall { op, args } => {
                    let _ = write!(out, "{v:?} = hl.{} {:?} : {ty:?}", op.name(), args);
                }
                Instr::HwCall { op, args } => {
                    let _ = write!(out, "{v:?} = hw.{} {:?} : {ty:?}", op.name(), args);
                }
                other => {
                    let _ = write!(out, "{v:?} = {other:?} : {ty:?}");
                }
            },
            ValueData::Erased => {
                let _ = write!(out, "{v:?} = <erased>");
            }
        }
    }

    pub fn dump_function(&self, f: FuncRef) -> String {
        let func = self.func(f);
        let mut out = format!("fn {} {{\n", func.name);
        for &v in &func.body {
            out.push_str("  ");
            self.dump_value(v, &mut out);
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete_type::ScalarType;

    fn empty_func(m: &mut Module<'_>) -> FuncRef {
        let ret = m.types.void();
        m.define_function("test", Vec::new(), ret)
    }

    #[test]
    fn use_lists_track_replace_and_erase() {
        let mut m = Module::new();
        let f = empty_func(&mut m);
        let a = m.const_u32(1);
        let b = m.const_u32(2);
        let t = m.types.scalar(ScalarType::UInt32);
        let add = m.push_instr(
            f,
            t,
            Instr::Binary {
                op: BinOp::Add,
                lhs: a,
                rhs: b,
            },
            SourceLoc::UNKNOWN,
        );
        assert_eq!(m.uses(a), &[add]);

        let c = m.const_u32(3);
        m.replace_all_uses(a, c);
        assert!(m.uses(a).is_empty());
        assert_eq!(m.uses(c), &[add]);
        match m.instr(add).unwrap() {
            Instr::Binary { lhs, .. } => assert_eq!(*lhs, c),
            _ => unreachable!(),
        }

        m.erase(add);
        assert!(m.is_erased(add));
        assert!(m.uses(c).is_empty());
        assert!(m.func(f).body.is_empty());
    }

    #[test]
    fn constants_are_interned_but_poison_is_not() {
        let mut m = Module::new();
        let a = m.const_u32(7);
        let b = m.const_u32(7);
        assert_eq!(a, b);
        let t = m.types.scalar(ScalarType::UInt32);
        let p0 = m.poison(t);
        let p1 = m.poison(t);
        assert_ne!(p0, p1);
    }

    #[test]
    fn cursor_insertion_preserves_order() {
        let mut m = Module::new();
        let f = empty_func(&mut m);
        let t = m.types.scalar(ScalarType::UInt32);
        let a = m.const_u32(1);
        let first = m.push_instr(f, t, Instr::Phi(smallvec::smallvec![a]), SourceLoc::UNKNOWN);
        let last = m.push_instr(f, t, Instr::Phi(smallvec::smallvec![a]), SourceLoc::UNKNOWN);
        let mut cur = m.position_of(last).unwrap();
        let mid = m.insert_instr(&mut cur, t, Instr::Phi(smallvec::smallvec![a]), SourceLoc::UNKNOWN);
        assert_eq!(m.func(f).body, vec![first, mid, last]);
    }
}
