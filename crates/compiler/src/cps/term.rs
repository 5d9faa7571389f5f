use std::rc::Rc;

use crate::{
    ast::{Literal, P, Symbol},
    il::term::{LVar, Prim},
    utils::{TreeEq, ensure_stack},
};

/// A CPS term. Every term ends in a transfer of control: there is no way for
/// control to fall off the end of a term.
#[derive(Debug, Clone)]
pub enum Term {
    /// Apply a continuation to arguments.
    Continue(P<LVar>, Vec<Atom>),
    /// Call `callee` with continuation `k` and arguments.
    App(Atom, P<LVar>, Vec<Atom>),
    /// Branch to one of two nullary continuations.
    If(Atom, P<LVar>, P<LVar>),

    /// Bind continuations. Bindings scope over the body only.
    Letk(Vec<Rc<Cont>>, Rc<Term>),
    /// Bind functions. Bindings scope over every function body and the body.
    Fix(Vec<Rc<Func>>, Rc<Term>),
    Let(P<LVar>, Expression, Rc<Term>),
}

/// Trivial values: the only things that may appear in argument position, and
/// the only things cleanup is allowed to duplicate.
#[derive(Debug, Clone)]
pub enum Atom {
    Constant(Literal),
    Null,
    Global(Symbol),
    Local(P<LVar>),
}

#[derive(Debug, Clone)]
pub struct Func {
    pub name: Option<Symbol>,
    pub binding: P<LVar>,
    pub return_cont: P<LVar>,
    pub args: Vec<P<LVar>>,
    pub body: Rc<Term>,
}

impl Func {
    pub fn with_body(&self, body: Rc<Term>) -> P<Self> {
        P(Func {
            body,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone)]
pub struct Cont {
    pub binding: P<LVar>,
    pub args: Vec<P<LVar>>,
    pub body: Rc<Term>,
}

impl Cont {
    pub fn with_body(&self, body: Rc<Term>) -> P<Self> {
        P(Cont {
            body,
            ..self.clone()
        })
    }
}

/// Primitive expressions bound by `Let`. Evaluating one may have effects.
#[derive(Debug, Clone)]
pub enum Expression {
    Field(Atom, Symbol),
    /// Store into a field, yielding the stored value.
    SetField(Atom, Symbol, Atom),
    /// Read of a global that the program assigns somewhere. Such reads are
    /// ordered with respect to the assignments, unlike [`Atom::Global`].
    Global(Symbol),
    /// Store into a global, yielding the stored value.
    SetGlobal(Symbol, Atom),
    PrimCall(Prim, Vec<Atom>),
}

impl Expression {
    pub fn atoms(&self) -> Vec<&Atom> {
        match self {
            Expression::Field(object, _) => vec![object],
            Expression::SetField(object, _, value) => vec![object, value],
            Expression::Global(_) => vec![],
            Expression::SetGlobal(_, value) => vec![value],
            Expression::PrimCall(_, args) => args.iter().collect(),
        }
    }

    pub fn map_atoms(&self, mut f: impl FnMut(&Atom) -> Atom) -> Expression {
        match self {
            Expression::Field(object, name) => Expression::Field(f(object), name.clone()),
            Expression::SetField(object, name, value) => {
                Expression::SetField(f(object), name.clone(), f(value))
            }
            Expression::Global(name) => Expression::Global(name.clone()),
            Expression::SetGlobal(name, value) => Expression::SetGlobal(name.clone(), f(value)),
            Expression::PrimCall(prim, args) => Expression::PrimCall(*prim, args.iter().map(f).collect()),
        }
    }

    /// Whether the binding may be dropped when its result is unused.
    ///
    /// Field reads are not pure: they may run a getter.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Expression::Global(_) | Expression::PrimCall(Prim::Box | Prim::Unbox, _)
        )
    }
}

impl Term {
    /// Number of terms, for logging.
    pub fn size(&self) -> usize {
        ensure_stack(|| match self {
            Term::Let(_, _, body) => body.size() + 1,
            Term::Letk(conts, body) => {
                conts.iter().map(|c| c.body.size()).sum::<usize>() + body.size() + 1
            }
            Term::Fix(funs, body) => {
                funs.iter().map(|f| f.body.size()).sum::<usize>() + body.size() + 1
            }
            _ => 1,
        })
    }

    /// Whether `var` occurs anywhere in the term.
    pub fn mentions(&self, var: &P<LVar>) -> bool {
        let atom = |atom: &Atom| matches!(atom, Atom::Local(local) if local == var);
        ensure_stack(|| match self {
            Term::Continue(k, args) => k == var || args.iter().any(atom),
            Term::App(callee, k, args) => atom(callee) || k == var || args.iter().any(atom),
            Term::If(test, kt, kf) => atom(test) || kt == var || kf == var,
            Term::Letk(conts, body) => {
                conts.iter().any(|cont| cont.body.mentions(var)) || body.mentions(var)
            }
            Term::Fix(funcs, body) => {
                funcs.iter().any(|func| func.body.mentions(var)) || body.mentions(var)
            }
            Term::Let(_, expr, body) => expr.atoms().into_iter().any(atom) || body.mentions(var),
        })
    }

    fn is_leaf(&self) -> bool {
        matches!(self, Term::Continue(..) | Term::App(..) | Term::If(..))
    }

    /// Move uniquely owned subterms into `out`, leaving `self` shallow.
    ///
    /// A detached body is replaced by a `Continue` to one of the node's own
    /// binders, which only exists so that the node stays well-typed while it
    /// is dropped.
    fn detach_children(&mut self, out: &mut Vec<Rc<Term>>) {
        let (anchor, body) = match self {
            Term::Continue(..) | Term::App(..) | Term::If(..) => return,
            Term::Letk(conts, body) => {
                let Some(anchor) = conts.first().map(|cont| cont.binding.clone()) else {
                    return;
                };
                for cont in std::mem::take(conts) {
                    if let Ok(cont) = Rc::try_unwrap(cont) {
                        out.push(cont.body);
                    }
                }
                (anchor, body)
            }
            Term::Fix(funcs, body) => {
                let Some(anchor) = funcs.first().map(|func| func.binding.clone()) else {
                    return;
                };
                for func in std::mem::take(funcs) {
                    if let Ok(func) = Rc::try_unwrap(func) {
                        out.push(func.body);
                    }
                }
                (anchor, body)
            }
            Term::Let(var, _, body) => (var.clone(), body),
        };

        if Rc::strong_count(body) == 1 && !body.is_leaf() {
            out.push(std::mem::replace(body, Rc::new(Term::Continue(anchor, Vec::new()))));
        }
    }
}

// Straight-line programs become continuation chains as deep as the program is
// long, so dropping must not recurse.
impl Drop for Term {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(term) = pending.pop() {
            if let Ok(mut term) = Rc::try_unwrap(term) {
                term.detach_children(&mut pending);
            }
        }
    }
}

impl TreeEq for Term {
    fn tree_eq(&self, other: &Self) -> bool {
        ensure_stack(|| match (self, other) {
            (Term::Continue(a1, a2), Term::Continue(b1, b2)) => a1.tree_eq(b1) && a2.tree_eq(b2),
            (Term::App(a1, a2, a3), Term::App(b1, b2, b3)) => {
                a1.tree_eq(b1) && a2.tree_eq(b2) && a3.tree_eq(b3)
            }
            (Term::If(a1, a2, a3), Term::If(b1, b2, b3)) => {
                a1.tree_eq(b1) && a2.tree_eq(b2) && a3.tree_eq(b3)
            }
            (Term::Letk(a1, a2), Term::Letk(b1, b2)) => a1.tree_eq(b1) && a2.tree_eq(b2),
            (Term::Fix(a1, a2), Term::Fix(b1, b2)) => a1.tree_eq(b1) && a2.tree_eq(b2),
            (Term::Let(a1, a2, a3), Term::Let(b1, b2, b3)) => {
                a1.tree_eq(b1) && a2.tree_eq(b2) && a3.tree_eq(b3)
            }
            _ => false,
        })
    }
}

impl TreeEq for Atom {
    fn tree_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Atom::Constant(a), Atom::Constant(b)) => a.same(b),
            (Atom::Null, Atom::Null) => true,
            (Atom::Global(a), Atom::Global(b)) => a == b,
            (Atom::Local(a), Atom::Local(b)) => a.tree_eq(b),
            _ => false,
        }
    }
}

impl TreeEq for Func {
    fn tree_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.binding.tree_eq(&other.binding)
            && self.return_cont.tree_eq(&other.return_cont)
            && self.args == other.args
            && self.body.tree_eq(&other.body)
    }
}

impl TreeEq for Cont {
    fn tree_eq(&self, other: &Self) -> bool {
        self.binding.tree_eq(&other.binding)
            && self.args == other.args
            && self.body.tree_eq(&other.body)
    }
}

impl TreeEq for LVar {
    fn tree_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl TreeEq for Expression {
    fn tree_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expression::Field(a1, a2), Expression::Field(b1, b2)) => a1.tree_eq(b1) && a2 == b2,
            (Expression::SetField(a1, a2, a3), Expression::SetField(b1, b2, b3)) => {
                a1.tree_eq(b1) && a2 == b2 && a3.tree_eq(b3)
            }
            (Expression::Global(a), Expression::Global(b)) => a == b,
            (Expression::SetGlobal(a1, a2), Expression::SetGlobal(b1, b2)) => a1 == b1 && a2.tree_eq(b2),
            (Expression::PrimCall(a1, a2), Expression::PrimCall(b1, b2)) => a1 == b1 && a2.tree_eq(b2),
            _ => false,
        }
    }
}
