use std::{fmt, hash::Hash};

use crate::{
    ast::{Literal, P, Symbol},
    utils::ensure_stack,
};

/// Immediate form.
///
/// Surface syntax is lowered into IForms before CPS conversion. IForms have no
/// multi-form bodies, definitions or collection literals: bodies become nested
/// `Let`s, collections become calls to global constructors and every
/// identifier is either resolved to its binder (`LRef`) or left global
/// (`GRef`).
///
/// `LSet` only exists between conversion and assignment elimination, which
/// rewrites every mutated variable into a box.
#[derive(Debug, Clone)]
pub enum IForm {
    Const(Literal),
    /// The null value: result of an empty body or a missing else branch.
    Null,
    LRef(P<LVar>),
    LSet(P<LVar>, P<IForm>),
    GRef(Symbol),
    GSet(Symbol, P<IForm>),
    Lambda(P<Lambda>),
    App(P<IForm>, Vec<P<IForm>>),
    PrimApp(Prim, Vec<P<IForm>>),
    If(P<IForm>, P<IForm>, P<IForm>),
    Let(P<LVar>, P<IForm>, P<IForm>),
    /// Recursive binding of lambdas: every variable is in scope in every
    /// lambda and in the body.
    Fix(Vec<P<LVar>>, Vec<P<Lambda>>, P<IForm>),
    Field(P<IForm>, Symbol),
    /// `object.name = value`. The value is evaluated after the object and is
    /// the result of the form.
    SetField(P<IForm>, Symbol, P<IForm>),
}

/// Primitive operations introduced by the compiler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    /// `(box v)`: a fresh mutable cell holding `v`.
    Box,
    /// `(unbox b)`: current contents of `b`.
    Unbox,
    /// `(box-set! b v)`: store `v` into `b`, yielding `v`.
    BoxSet,
}

impl Prim {
    pub fn name(self) -> &'static str {
        match self {
            Prim::Box => "box",
            Prim::Unbox => "unbox",
            Prim::BoxSet => "box-set!",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Prim::Box | Prim::Unbox => 1,
            Prim::BoxSet => 2,
        }
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct Lambda {
    /// Name of the definition this lambda was bound by, if any.
    pub name: Option<Symbol>,
    pub params: Vec<P<LVar>>,
    pub body: P<IForm>,
}

/// A binder. Two `LVar`s are the same variable only if they are the same
/// allocation; `id` is unique per pipeline run and only used for printing.
#[derive(Debug)]
pub struct LVar {
    pub name: Symbol,
    pub id: u32,
}

impl LVar {
    pub fn new(name: Symbol, id: u32) -> P<LVar> {
        P(LVar { name, id })
    }
}

impl fmt::Display for LVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.id)
    }
}

impl Hash for LVar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self as *const Self).hash(state);
    }
}

impl PartialEq for LVar {
    fn eq(&self, other: &Self) -> bool {
        self as *const Self == other as *const Self
    }
}

impl Eq for LVar {}

impl IForm {
    /// Largest variable id bound anywhere in the form. Passes that need fresh
    /// variables number them after it.
    pub fn max_var_id(&self) -> Option<u32> {
        ensure_stack(|| match self {
            IForm::Const(_) | IForm::Null | IForm::GRef(_) => None,
            IForm::LRef(var) => Some(var.id),
            IForm::LSet(var, value) => Some(var.id).max(value.max_var_id()),
            IForm::GSet(_, value) => value.max_var_id(),
            IForm::Lambda(lambda) => lambda.max_var_id(),
            IForm::App(callee, args) => args
                .iter()
                .filter_map(|arg| arg.max_var_id())
                .chain(callee.max_var_id())
                .max(),
            IForm::PrimApp(_, args) => args.iter().filter_map(|arg| arg.max_var_id()).max(),
            IForm::If(test, cons, alt) => [test, cons, alt]
                .into_iter()
                .filter_map(|form| form.max_var_id())
                .max(),
            IForm::Let(var, init, body) => [Some(var.id), init.max_var_id(), body.max_var_id()]
                .into_iter()
                .flatten()
                .max(),
            IForm::Fix(vars, lambdas, body) => vars
                .iter()
                .map(|var| var.id)
                .chain(lambdas.iter().filter_map(|lambda| lambda.max_var_id()))
                .chain(body.max_var_id())
                .max(),
            IForm::Field(object, _) => object.max_var_id(),
            IForm::SetField(object, _, value) => object.max_var_id().max(value.max_var_id()),
        })
    }

    /// Number of nodes, for logging.
    pub fn size(&self) -> usize {
        ensure_stack(|| match self {
            IForm::Const(_) | IForm::Null | IForm::GRef(_) | IForm::LRef(_) => 1,
            IForm::LSet(_, value) | IForm::GSet(_, value) => 1 + value.size(),
            IForm::Lambda(lambda) => 1 + lambda.body.size(),
            IForm::App(callee, args) => 1 + callee.size() + args.iter().map(|a| a.size()).sum::<usize>(),
            IForm::PrimApp(_, args) => 1 + args.iter().map(|a| a.size()).sum::<usize>(),
            IForm::If(test, cons, alt) => 1 + test.size() + cons.size() + alt.size(),
            IForm::Let(_, init, body) => 1 + init.size() + body.size(),
            IForm::Fix(_, lambdas, body) => {
                1 + lambdas.iter().map(|l| 1 + l.body.size()).sum::<usize>() + body.size()
            }
            IForm::Field(object, _) => 1 + object.size(),
            IForm::SetField(object, _, value) => 1 + object.size() + value.size(),
        })
    }

    fn is_leaf(&self) -> bool {
        matches!(
            self,
            IForm::Const(_) | IForm::Null | IForm::LRef(_) | IForm::GRef(_)
        )
    }

    /// Move uniquely owned subforms into `out`, leaving `self` shallow.
    fn detach_children(&mut self, out: &mut Vec<P<IForm>>) {
        fn take(slot: &mut P<IForm>, out: &mut Vec<P<IForm>>) {
            if P::strong_count(slot) == 1 && !slot.is_leaf() {
                out.push(std::mem::replace(slot, P(IForm::Null)));
            }
        }

        match self {
            IForm::Const(_) | IForm::Null | IForm::LRef(_) | IForm::GRef(_) => {}
            IForm::LSet(_, value) | IForm::GSet(_, value) | IForm::Field(value, _) => take(value, out),
            IForm::Lambda(lambda) => {
                if let Some(lambda) = P::get_mut(lambda) {
                    take(&mut lambda.body, out);
                }
            }
            IForm::App(callee, args) => {
                take(callee, out);
                out.append(args);
            }
            IForm::PrimApp(_, args) => out.append(args),
            IForm::If(test, cons, alt) => {
                take(test, out);
                take(cons, out);
                take(alt, out);
            }
            IForm::Let(_, init, body) => {
                take(init, out);
                take(body, out);
            }
            IForm::Fix(_, lambdas, body) => {
                for lambda in lambdas.iter_mut() {
                    if let Some(lambda) = P::get_mut(lambda) {
                        take(&mut lambda.body, out);
                    }
                }
                take(body, out);
            }
            IForm::SetField(object, _, value) => {
                take(object, out);
                take(value, out);
            }
        }
    }
}

// Long bodies nest thousands of `Let`s deep; dropping them recursively would
// overflow the caller's stack.
impl Drop for IForm {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(form) = pending.pop() {
            if let Ok(mut form) = P::try_unwrap(form) {
                form.detach_children(&mut pending);
            }
        }
    }
}

impl Lambda {
    fn max_var_id(&self) -> Option<u32> {
        self.params
            .iter()
            .map(|p| p.id)
            .chain(self.body.max_var_id())
            .max()
    }
}
