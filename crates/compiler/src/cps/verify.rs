//! Well-formedness of CPS terms.
//!
//! Checked properties:
//!
//! - every variable is bound exactly once;
//! - every value reference is to a value variable in scope (functions bound
//!   by one `Fix` see each other and themselves), and every
//!   continuation reference to a continuation in scope of the same function
//!   (continuations never cross function boundaries);
//! - continuations are applied to as many arguments as they take; return
//!   continuations take exactly one, branch targets none;
//! - primitives get as many arguments as they take.

use std::collections::HashSet;

use im::HashMap;

use crate::{
    ast::P,
    cps::term::{Atom, Expression, Func, Term},
    error::Error,
    il::term::LVar,
    utils::ensure_stack,
};

struct Verifier {
    bound: HashSet<P<LVar>>,
}

#[derive(Clone, Default)]
struct Scope {
    values: im::HashSet<P<LVar>>,
    conts: HashMap<P<LVar>, usize>,
}

pub fn verify(func: &Func) -> Result<(), Box<Error>> {
    let mut verifier = Verifier {
        bound: HashSet::new(),
    };
    verifier.func(func, &Scope::default())
}

impl Verifier {
    fn bind(&mut self, var: &P<LVar>) -> Result<(), Box<Error>> {
        if !self.bound.insert(var.clone()) {
            return Err(Error::invariant(format!("variable {var} is bound twice")));
        }
        Ok(())
    }

    fn func(&mut self, func: &Func, outer: &Scope) -> Result<(), Box<Error>> {
        self.bind(&func.return_cont)?;
        let mut scope = Scope {
            values: outer.values.clone(),
            conts: HashMap::unit(func.return_cont.clone(), 1),
        };
        for arg in &func.args {
            self.bind(arg)?;
            scope.values.insert(arg.clone());
        }
        self.term(&func.body, &scope)
    }

    fn atom(&self, atom: &Atom, scope: &Scope) -> Result<(), Box<Error>> {
        match atom {
            Atom::Local(var) if !scope.values.contains(var) => {
                Err(Error::invariant(format!("reference to unbound variable {var}")))
            }
            _ => Ok(()),
        }
    }

    fn cont(&self, k: &P<LVar>, arity: usize, scope: &Scope) -> Result<(), Box<Error>> {
        match scope.conts.get(k) {
            None => Err(Error::invariant(format!("reference to unbound continuation {k}"))),
            Some(&expected) if expected != arity => Err(Error::invariant(format!(
                "continuation {k} takes {expected} arguments but is applied to {arity}"
            ))),
            Some(_) => Ok(()),
        }
    }

    fn term(&mut self, term: &Term, scope: &Scope) -> Result<(), Box<Error>> {
        ensure_stack(|| match term {
            Term::Continue(k, args) => {
                self.cont(k, args.len(), scope)?;
                args.iter().try_for_each(|arg| self.atom(arg, scope))
            }

            Term::App(callee, k, args) => {
                self.atom(callee, scope)?;
                self.cont(k, 1, scope)?;
                args.iter().try_for_each(|arg| self.atom(arg, scope))
            }

            Term::If(test, kt, kf) => {
                self.atom(test, scope)?;
                self.cont(kt, 0, scope)?;
                self.cont(kf, 0, scope)
            }

            Term::Letk(conts, body) => {
                let mut inner = scope.clone();
                for cont in conts {
                    self.bind(&cont.binding)?;
                    let mut cont_scope = scope.clone();
                    for arg in &cont.args {
                        self.bind(arg)?;
                        cont_scope.values.insert(arg.clone());
                    }
                    self.term(&cont.body, &cont_scope)?;
                    inner.conts.insert(cont.binding.clone(), cont.args.len());
                }
                self.term(body, &inner)
            }

            Term::Fix(funcs, body) => {
                let mut inner = scope.clone();
                for func in funcs {
                    self.bind(&func.binding)?;
                    inner.values.insert(func.binding.clone());
                }
                for func in funcs {
                    self.func(func, &inner)?;
                }
                self.term(body, &inner)
            }

            Term::Let(var, expr, body) => {
                if let Expression::PrimCall(prim, args) = expr
                    && args.len() != prim.arity()
                {
                    return Err(Error::invariant(format!(
                        "primitive {prim} takes {} arguments but is applied to {}",
                        prim.arity(),
                        args.len()
                    )));
                }
                expr.atoms()
                    .into_iter()
                    .try_for_each(|atom| self.atom(atom, scope))?;
                self.bind(var)?;
                let mut inner = scope.clone();
                inner.values.insert(var.clone());
                self.term(body, &inner)
            }
        })
    }
}
