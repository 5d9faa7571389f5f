//! Shrinking reductions over CPS terms.
//!
//! Each pass takes a census of the term and then rewrites it in one walk:
//!
//! - dead continuations and functions are dropped, and so are dead bindings
//!   of pure expressions;
//! - continuations applied exactly once are inlined at their use site, and
//!   so are functions called exactly once with a matching number of
//!   arguments (never from their own body);
//! - continuations that only forward their parameters to another
//!   continuation are replaced by that continuation;
//! - conditionals on a constant jump straight to the selected branch.
//!
//! None of these create variables or duplicate anything but atoms, so the
//! term shrinks on every pass that changes it and the pass can be repeated
//! until nothing changes.

use std::rc::Rc;

use im::HashMap;

use crate::{
    ast::P,
    cps::term::{Atom, Cont, Expression, Func, Term},
    error::Error,
    il::term::LVar,
    utils::{ensure_stack, fixedpoint},
};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Count {
    applied: u32,
    as_value: u32,
}

struct Census {
    counts: HashMap<P<LVar>, Count>,
    /// Number of arguments at the last call site of each applied function.
    app_arity: HashMap<P<LVar>, usize>,
}

#[derive(Clone)]
struct State {
    census: Rc<Census>,
    atom_subst: HashMap<P<LVar>, Atom>,
    var_subst: HashMap<P<LVar>, P<LVar>>,

    /// Continuations that will be inlined at their only use site.
    cenv: HashMap<P<LVar>, Rc<Cont>>,
    /// Functions that will be inlined at their only call site.
    fenv: HashMap<P<LVar>, Rc<Func>>,
    /// Arity of every continuation in scope.
    karity: HashMap<P<LVar>, usize>,
}

impl State {
    fn new(census: Census) -> Self {
        State {
            census: Rc::new(census),
            atom_subst: HashMap::new(),
            var_subst: HashMap::new(),
            cenv: HashMap::new(),
            fenv: HashMap::new(),
            karity: HashMap::new(),
        }
    }

    fn is_dead(&self, var: &P<LVar>) -> bool {
        !self.census.counts.contains_key(var)
    }

    fn applied_once(&self, var: &P<LVar>) -> bool {
        self.census
            .counts
            .get(var)
            .is_some_and(|count| count.applied == 1 && count.as_value == 0)
    }

    fn with_var_to_atom_subst(mut self, from: P<LVar>, to: Atom) -> Self {
        self.atom_subst.insert(from, to);
        self
    }

    fn with_vars_to_atoms(self, from: &[P<LVar>], to: &[Atom]) -> Self {
        from.iter()
            .zip(to.iter())
            .fold(self, |s, (f, t)| s.with_var_to_atom_subst(f.clone(), t.clone()))
    }

    fn with_c_subst(mut self, from: P<LVar>, to: P<LVar>) -> Self {
        self.var_subst.insert(from, to);
        self
    }

    fn with_arity(mut self, k: P<LVar>, arity: usize) -> Self {
        self.karity.insert(k, arity);
        self
    }

    fn with_arities(mut self, conts: &[Rc<Cont>]) -> Self {
        for cont in conts {
            self.karity.insert(cont.binding.clone(), cont.args.len());
        }
        self
    }

    fn with_continuations(self, conts: &[Rc<Cont>]) -> Self {
        conts.iter().fold(self, |mut s, cont| {
            s.cenv.insert(cont.binding.clone(), cont.clone());
            s
        })
    }

    fn with_functions(self, funcs: &[Rc<Func>]) -> Self {
        funcs.iter().fold(self, |mut s, func| {
            s.fenv.insert(func.binding.clone(), func.clone());
            s
        })
    }

    fn substitute_atoms(&self, atoms: &[Atom]) -> Vec<Atom> {
        atoms.iter().map(|atom| self.atom_subst(atom)).collect()
    }

    fn atom_subst(&self, atom: &Atom) -> Atom {
        match atom {
            Atom::Local(var) => match self.atom_subst.get(var) {
                Some(next) => self.atom_subst(next),
                None => atom.clone(),
            },
            _ => atom.clone(),
        }
    }

    fn var_subst(&self, var: &P<LVar>) -> P<LVar> {
        let mut var = var.clone();
        while let Some(new_var) = self.var_subst.get(&var) {
            var = new_var.clone();
        }
        var
    }

    fn check_arity(&self, k: &P<LVar>, given: usize) -> Result<(), Box<Error>> {
        match self.karity.get(k) {
            Some(&expected) if expected != given => Err(Error::invariant(format!(
                "continuation {k} takes {expected} arguments but is applied to {given}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Count uses of every variable reachable from `tree`. Continuation and
/// function bodies are only counted once their binder is used, so code that
/// is only referenced from dead code is dead too.
fn census(tree: &Rc<Term>) -> Census {
    let mut census = Census {
        counts: HashMap::new(),
        app_arity: HashMap::new(),
    };
    let mut rhs: HashMap<P<LVar>, Rc<Term>> = HashMap::new();

    fn inc_app_use_n(name: &P<LVar>, census: &mut Census, rhs: &mut HashMap<P<LVar>, Rc<Term>>) {
        let curr_count = census.counts.get(name).copied().unwrap_or_default();
        census.counts.insert(
            name.clone(),
            Count {
                applied: curr_count.applied + 1,
                as_value: curr_count.as_value,
            },
        );
        if let Some(tree) = rhs.remove(name) {
            add_to_census(&tree, census, rhs);
        }
    }

    fn inc_val_use_n(name: &P<LVar>, census: &mut Census, rhs: &mut HashMap<P<LVar>, Rc<Term>>) {
        let curr_count = census.counts.get(name).copied().unwrap_or_default();
        census.counts.insert(
            name.clone(),
            Count {
                applied: curr_count.applied,
                as_value: curr_count.as_value + 1,
            },
        );
        if let Some(tree) = rhs.remove(name) {
            add_to_census(&tree, census, rhs);
        }
    }

    fn inc_val_use_a(atom: &Atom, census: &mut Census, rhs: &mut HashMap<P<LVar>, Rc<Term>>) {
        if let Atom::Local(name) = atom {
            inc_val_use_n(name, census, rhs);
        }
    }

    fn add_to_census(tree: &Rc<Term>, census: &mut Census, rhs: &mut HashMap<P<LVar>, Rc<Term>>) {
        ensure_stack(|| match &**tree {
            Term::Let(_, expr, body) => {
                for atom in expr.atoms() {
                    inc_val_use_a(atom, census, rhs);
                }
                add_to_census(body, census, rhs);
            }
            Term::Letk(conts, body) => {
                for cont in conts {
                    rhs.insert(cont.binding.clone(), cont.body.clone());
                }
                add_to_census(body, census, rhs);
            }
            Term::Fix(funcs, body) => {
                for fun in funcs {
                    rhs.insert(fun.binding.clone(), fun.body.clone());
                }
                add_to_census(body, census, rhs);
            }
            Term::Continue(cnt, args) => {
                inc_app_use_n(cnt, census, rhs);
                for arg in args.iter() {
                    inc_val_use_a(arg, census, rhs);
                }
            }
            Term::App(fun, ret_c, args) => {
                if let Atom::Local(name) = fun {
                    census.app_arity.insert(name.clone(), args.len());
                    inc_app_use_n(name, census, rhs);
                }
                inc_val_use_n(ret_c, census, rhs);
                for arg in args {
                    inc_val_use_a(arg, census, rhs);
                }
            }
            Term::If(test, then_c, else_c) => {
                inc_val_use_a(test, census, rhs);
                inc_val_use_n(then_c, census, rhs);
                inc_val_use_n(else_c, census, rhs);
            }
        })
    }

    add_to_census(tree, &mut census, &mut rhs);
    census
}

/// A continuation whose body only forwards its parameters, in order, to
/// another continuation `k`: `(cont (x y) (continue k x y))`.
fn forwards_to(cont: &Cont) -> Option<&P<LVar>> {
    let Term::Continue(target, args) = &*cont.body else {
        return None;
    };
    if *target == cont.binding || args.len() != cont.args.len() {
        return None;
    }
    let forwards = args
        .iter()
        .zip(cont.args.iter())
        .all(|(arg, param)| matches!(arg, Atom::Local(var) if var == param));
    forwards.then_some(target)
}

fn shrink_tree(tree: &Rc<Term>, state: State) -> Result<Rc<Term>, Box<Error>> {
    ensure_stack(|| match &**tree {
        Term::Let(binding, expr, body) => {
            if expr.is_pure() && state.is_dead(binding) {
                return shrink_tree(body, state);
            }
            let expr: Expression = expr.map_atoms(|atom| state.atom_subst(atom));
            let body = shrink_tree(body, state)?;
            Ok(Rc::new(Term::Let(binding.clone(), expr, body)))
        }

        Term::Letk(prev_conts, body) => {
            let mut inlined = Vec::new();
            let mut kept = Vec::new();
            for cont in prev_conts {
                if state.is_dead(&cont.binding) {
                    continue;
                }
                if state.applied_once(&cont.binding) {
                    inlined.push(cont.clone());
                } else {
                    kept.push(cont.clone());
                }
            }

            let mut state = state.with_arities(&inlined).with_continuations(&inlined);
            let mut conts = Vec::with_capacity(kept.len());
            for cont in kept {
                // A continuation's body does not see its siblings.
                let body = shrink_tree(&cont.body, state.clone())?;
                let cont = cont.with_body(body);
                let forward = forwards_to(&cont)
                    .filter(|target| !prev_conts.iter().any(|c| c.binding == **target))
                    .map(|target| state.var_subst(target))
                    .filter(|target| !state.cenv.contains_key(target));
                match forward {
                    Some(target) => state = state.with_c_subst(cont.binding.clone(), target),
                    None => conts.push(cont),
                }
            }

            let state = state.with_arities(&conts);
            let body = shrink_tree(body, state)?;
            if conts.is_empty() {
                Ok(body)
            } else {
                Ok(Rc::new(Term::Letk(conts, body)))
            }
        }

        Term::Fix(prev_funcs, body) => {
            let mut inlined = Vec::new();
            let mut kept = Vec::new();
            for func in prev_funcs {
                if state.is_dead(&func.binding) {
                    continue;
                }
                let arity_matches = state.census.app_arity.get(&func.binding) == Some(&func.args.len());
                if state.applied_once(&func.binding)
                    && arity_matches
                    && !func.body.mentions(&func.binding)
                {
                    inlined.push(func.clone());
                } else {
                    kept.push(func);
                }
            }

            // The only call of an inlined function may sit in a sibling.
            let state = state.with_functions(&inlined);
            let mut funcs = Vec::with_capacity(kept.len());
            for func in kept {
                let inner = state.clone().with_arity(func.return_cont.clone(), 1);
                let body = shrink_tree(&func.body, inner)?;
                funcs.push(func.with_body(body));
            }

            let body = shrink_tree(body, state)?;
            if funcs.is_empty() {
                Ok(body)
            } else {
                Ok(Rc::new(Term::Fix(funcs, body)))
            }
        }

        Term::Continue(k_prev, args_prev) => {
            let k = state.var_subst(k_prev);
            let args = state.substitute_atoms(args_prev);
            state.check_arity(&k, args.len())?;

            let Some(cont) = state.cenv.get(&k).cloned() else {
                return Ok(Rc::new(Term::Continue(k, args)));
            };

            shrink_tree(&cont.body, state.with_vars_to_atoms(&cont.args, &args))
        }

        Term::App(fun_prev, retc_prev, args_prev) => {
            let retc = state.var_subst(retc_prev);
            let args = state.substitute_atoms(args_prev);
            let fun = state.atom_subst(fun_prev);
            state.check_arity(&retc, 1)?;

            if let Atom::Local(name) = &fun
                && let Some(func) = state.fenv.get(name).cloned()
                && func.args.len() == args.len()
            {
                let state = state
                    .with_vars_to_atoms(&func.args, &args)
                    .with_c_subst(func.return_cont.clone(), retc);
                return shrink_tree(&func.body, state);
            }

            Ok(Rc::new(Term::App(fun, retc, args)))
        }

        Term::If(test, cons, alt) => {
            let test = state.atom_subst(test);
            let cons = state.var_subst(cons);
            let alt = state.var_subst(alt);
            state.check_arity(&cons, 0)?;
            state.check_arity(&alt, 0)?;

            let taken = match &test {
                Atom::Null => Some(&alt),
                Atom::Constant(lit) if lit.is_falsy() => Some(&alt),
                Atom::Constant(_) => Some(&cons),
                Atom::Global(_) | Atom::Local(_) => None,
            };

            match taken {
                Some(k) => Ok(Rc::new(Term::Continue(k.clone(), vec![]))),
                None => Ok(Rc::new(Term::If(test, cons, alt))),
            }
        }
    })
}

/// One shrinking pass over a whole function.
pub fn shrink(func: &P<Func>) -> Result<P<Func>, Box<Error>> {
    let census = census(&func.body);
    let state = State::new(census).with_arity(func.return_cont.clone(), 1);

    let body = shrink_tree(&func.body, state)?;
    Ok(func.with_body(body))
}

/// Shrink `func` until it stops changing, or at most `max_passes` times.
pub fn rewrite(func: &P<Func>, max_passes: Option<usize>) -> Result<P<Func>, Box<Error>> {
    let before = func.body.size();
    let pass = |func: &P<Func>| -> Result<P<Func>, Box<Error>> {
        let next = shrink(func)?;
        log::trace!("shrink pass: {} -> {} terms", func.body.size(), next.body.size());
        Ok(next)
    };
    let (simplified, passes) = fixedpoint(func.clone(), max_passes)(pass)?;
    log::debug!(
        "cleanup finished after {passes} passes: {before} -> {} terms",
        simplified.body.size()
    );
    Ok(simplified)
}
