use std::{collections::HashSet, rc::Rc};

use crate::{
    ast::{P, Symbol},
    cps::term::{Atom, Cont, Expression, Func, Term},
    error::Error,
    il::term::{IForm, LVar, Lambda},
    utils::ensure_stack,
};

/// Converts [`IForm`]s into CPS.
///
/// Two flavours of "current continuation" exist during conversion: `t_k`
/// takes a meta-continuation (a Rust closure that builds the rest of the term
/// from an atom), `t_c` takes an object continuation (a variable naming a CPS
/// continuation). Converting against an object continuation never introduces
/// administrative bindings for it.
pub struct CPSBuilder {
    varcount: u32,
    /// Globals assigned somewhere in the program. Reads of them are bound
    /// with `Let` instead of being passed around as atoms.
    assigned_globals: HashSet<Symbol>,
    /// First invariant violation met during conversion.
    error: Option<Box<Error>>,
}

pub type FCont<'a> = Box<dyn FnOnce(&mut CPSBuilder, Rc<Term>) -> Rc<Term> + 'a>;
pub type MetaCont<'a> = Box<dyn FnOnce(&mut CPSBuilder, Atom) -> Rc<Term> + 'a>;
pub type MetaContMany<'a> = Box<dyn FnOnce(&mut CPSBuilder, Vec<Atom>) -> Rc<Term> + 'a>;

impl CPSBuilder {
    /// `first_id` must be greater than every variable id in the input.
    pub fn new(first_id: u32) -> Self {
        CPSBuilder {
            varcount: first_id,
            assigned_globals: HashSet::new(),
            error: None,
        }
    }

    pub fn assigned_globals(mut self, globals: HashSet<Symbol>) -> Self {
        self.assigned_globals = globals;
        self
    }

    /// Convert a program. The input must be free of `LSet`.
    pub fn convert_toplevel(mut self, form: &IForm) -> Result<Rc<Func>, Box<Error>> {
        let binding = self.fresh_variable("program");
        let return_cont = self.fresh_variable("ret");
        let body = self.t_c(form, return_cont.clone());
        let func = Rc::new(Func {
            name: Some(Symbol::new("program")),
            binding,
            return_cont,
            args: vec![],
            body,
        });
        match self.error {
            Some(err) => Err(err),
            None => Ok(func),
        }
    }

    pub fn fresh_variable(&mut self, prefix: &str) -> P<LVar> {
        let var = LVar::new(Symbol::new(prefix), self.varcount);
        self.varcount += 1;
        var
    }

    pub fn letk<'a>(&mut self, conts: Vec<Rc<Cont>>) -> ((), FCont<'a>) {
        let cont = Box::new(move |_this: &mut CPSBuilder, body: Rc<Term>| {
            Rc::new(Term::Letk(conts, body))
        });
        ((), cont)
    }

    fn unboxed_assignment(&mut self, var: &LVar) {
        if self.error.is_none() {
            self.error = Some(Error::invariant(format!(
                "assignment to {var} reached CPS conversion"
            )));
        }
    }
}

macro_rules! with_cps {
    ($cps: ident; $binder: ident <- $expr: expr; $($rest:tt)+) => {{
        let ($binder, cont): (_, $crate::cps::convert::FCont) = $expr;

        let inner = { with_cps!($cps; $($rest)+) };

        cont($cps, inner)
    }};

    ($cps: ident; letk $k: ident ($($arg:ident),*) = $e: expr; $($rest:tt)+) => {{
        let $k = $cps.fresh_variable(stringify!($k));
        $(
            let $arg = $cps.fresh_variable(stringify!($arg));
        )*
        let cont = $crate::cps::term::Cont {
            binding: $k.clone(),
            args: vec![$($arg.clone()),*],
            body: $e,
        };

        with_cps!($cps;
            _letk <- $cps.letk(vec![::std::rc::Rc::new(cont)]);
            $($rest)+
        )
    }};

    ($cps: ident; continue $k: ident ($($arg:expr),*)) => {{
        let _ = &$cps;
        ::std::rc::Rc::new($crate::cps::term::Term::Continue($k.clone(), vec![$($arg.clone()),*]))
    }};

    ($cps: ident; $callee: ident ($k: ident, $args: ident ...)) => {{
        let _ = &$cps;
        ::std::rc::Rc::new($crate::cps::term::Term::App($callee.clone(), $k.clone(), $args))
    }};

    ($cps: ident; let $binder: ident = $e: expr; $($rest:tt)+) => {{
        let e = $e;
        let $binder = $cps.fresh_variable(stringify!($binder));
        let rv = $binder.clone();
        let inner = with_cps!($cps; $($rest)+);
        ::std::rc::Rc::new($crate::cps::term::Term::Let(rv, e, inner))
    }};

    ($cps: ident; @tk $binder: ident = $e: expr; $($rest:tt)+) => {{
        let e = $e;
        $cps.t_k(e, Box::new(move |$cps: &mut CPSBuilder, $binder: Atom| {
            with_cps!($cps; $($rest)+)
        }))
    }};

    ($cps: ident; @tk* $binder: ident = $e: expr; $($rest:tt)+) => {{
        let e = $e;
        $cps.t_k_many(e, Box::new(move |$cps: &mut CPSBuilder, $binder: Vec<Atom>| {
            with_cps!($cps; $($rest)+)
        }))
    }};

    ($cps: ident; # $expr: expr) => {{
        $expr
    }};
}

impl CPSBuilder {
    pub fn t_k<'a>(&mut self, form: &'a IForm, fk: MetaCont<'a>) -> Rc<Term> {
        ensure_stack(move || {
            let cps = self;

            match form {
                IForm::Const(lit) => fk(cps, Atom::Constant(lit.clone())),
                IForm::Null => fk(cps, Atom::Null),
                IForm::GRef(sym) if cps.assigned_globals.contains(sym) => with_cps!(cps;
                    let rv = Expression::Global(sym.clone());
                    # fk(cps, Atom::Local(rv))
                ),
                IForm::GRef(sym) => fk(cps, Atom::Global(sym.clone())),
                IForm::LRef(var) => fk(cps, Atom::Local(var.clone())),

                IForm::LSet(var, _) => {
                    cps.unboxed_assignment(var);
                    fk(cps, Atom::Null)
                }

                IForm::GSet(sym, value) => with_cps!(cps;
                    @tk value = value;
                    let rv = Expression::SetGlobal(sym.clone(), value);
                    # fk(cps, Atom::Local(rv))
                ),

                IForm::Lambda(lambda) => {
                    let tmp = cps.fresh_lambda_binding(lambda);
                    let f = cps.convert_lambda(lambda, tmp.clone());
                    let rest = fk(cps, Atom::Local(tmp));

                    Rc::new(Term::Fix(vec![f], rest))
                }

                IForm::Fix(vars, lambdas, body) => {
                    let funcs = cps.convert_fix(vars, lambdas);
                    let body = cps.t_k(body, fk);
                    Rc::new(Term::Fix(funcs, body))
                }

                IForm::App(callee, args) => with_cps!(cps;
                    letk k (rv) = fk(cps, Atom::Local(rv));
                    @tk callee = callee;
                    @tk* args = args;
                    callee(k, args...)
                ),

                IForm::PrimApp(prim, args) => with_cps!(cps;
                    @tk* args = args;
                    let rv = Expression::PrimCall(*prim, args);
                    # fk(cps, Atom::Local(rv))
                ),

                IForm::Field(object, name) => with_cps!(cps;
                    @tk object = object;
                    let rv = Expression::Field(object, name.clone());
                    # fk(cps, Atom::Local(rv))
                ),

                IForm::SetField(object, name, value) => with_cps!(cps;
                    @tk object = object;
                    @tk value = value;
                    let rv = Expression::SetField(object, name.clone(), value);
                    # fk(cps, Atom::Local(rv))
                ),

                IForm::Let(var, init, body) => {
                    let k = cps.fresh_variable("k");
                    let body = cps.t_k(body, fk);
                    let cont = Rc::new(Cont {
                        binding: k.clone(),
                        args: vec![var.clone()],
                        body,
                    });
                    let init = cps.t_c(init, k);

                    Rc::new(Term::Letk(vec![cont], init))
                }

                IForm::If(test, cons, alt) => with_cps!(cps;
                    @tk atest = test;
                    letk join (rv) = fk(cps, Atom::Local(rv));
                    letk kt () = cps.t_c(cons, join.clone());
                    letk kf () = cps.t_c(alt, join);
                    # Rc::new(Term::If(atest, kt, kf))
                ),
            }
        })
    }

    pub fn t_c<'a>(&mut self, form: &'a IForm, k: P<LVar>) -> Rc<Term> {
        ensure_stack(move || {
            let cps = self;

            match form {
                IForm::Const(lit) => {
                    let atom = Atom::Constant(lit.clone());
                    with_cps!(cps; continue k(atom))
                }
                IForm::Null => with_cps!(cps; continue k(Atom::Null)),
                IForm::GRef(sym) if cps.assigned_globals.contains(sym) => with_cps!(cps;
                    let rv = Expression::Global(sym.clone());
                    continue k(Atom::Local(rv))
                ),
                IForm::GRef(sym) => {
                    let atom = Atom::Global(sym.clone());
                    with_cps!(cps; continue k(atom))
                }
                IForm::LRef(var) => {
                    let atom = Atom::Local(var.clone());
                    with_cps!(cps; continue k(atom))
                }

                IForm::LSet(var, _) => {
                    cps.unboxed_assignment(var);
                    with_cps!(cps; continue k(Atom::Null))
                }

                IForm::GSet(sym, value) => with_cps!(cps;
                    @tk value = value;
                    let rv = Expression::SetGlobal(sym.clone(), value);
                    continue k(Atom::Local(rv))
                ),

                IForm::Lambda(lambda) => {
                    let tmp = cps.fresh_lambda_binding(lambda);
                    let f = cps.convert_lambda(lambda, tmp.clone());
                    let rest = with_cps!(cps; continue k(Atom::Local(tmp)));

                    Rc::new(Term::Fix(vec![f], rest))
                }

                IForm::Fix(vars, lambdas, body) => {
                    let funcs = cps.convert_fix(vars, lambdas);
                    let body = cps.t_c(body, k);
                    Rc::new(Term::Fix(funcs, body))
                }

                IForm::App(callee, args) => with_cps!(cps;
                    @tk callee = callee;
                    @tk* args = args;
                    callee(k, args...)
                ),

                IForm::PrimApp(prim, args) => with_cps!(cps;
                    @tk* args = args;
                    let rv = Expression::PrimCall(*prim, args);
                    continue k(Atom::Local(rv))
                ),

                IForm::Field(object, name) => with_cps!(cps;
                    @tk object = object;
                    let rv = Expression::Field(object, name.clone());
                    continue k(Atom::Local(rv))
                ),

                IForm::SetField(object, name, value) => with_cps!(cps;
                    @tk object = object;
                    @tk value = value;
                    let rv = Expression::SetField(object, name.clone(), value);
                    continue k(Atom::Local(rv))
                ),

                IForm::Let(var, init, body) => {
                    let kl = cps.fresh_variable("k");
                    let body = cps.t_c(body, k);
                    let bind = Rc::new(Cont {
                        binding: kl.clone(),
                        args: vec![var.clone()],
                        body,
                    });
                    let init = cps.t_c(init, kl);

                    Rc::new(Term::Letk(vec![bind], init))
                }

                IForm::If(test, cons, alt) => with_cps!(cps;
                    @tk atest = test;
                    letk kt () = cps.t_c(cons, k.clone());
                    letk kf () = cps.t_c(alt, k);
                    # Rc::new(Term::If(atest, kt, kf))
                ),
            }
        })
    }

    fn fresh_lambda_binding(&mut self, lambda: &Lambda) -> P<LVar> {
        match &lambda.name {
            Some(name) => self.fresh_variable(name.as_str()),
            None => self.fresh_variable("f"),
        }
    }

    /// Convert a lambda into a function taking its return continuation as an
    /// extra leading parameter.
    pub fn convert_lambda(&mut self, lambda: &Lambda, binding: P<LVar>) -> Rc<Func> {
        let return_cont = self.fresh_variable("ret");
        let body = self.t_c(&lambda.body, return_cont.clone());
        Rc::new(Func {
            name: lambda.name.clone(),
            binding,
            return_cont,
            args: lambda.params.clone(),
            body,
        })
    }

    fn convert_fix(&mut self, vars: &[P<LVar>], lambdas: &[P<Lambda>]) -> Vec<Rc<Func>> {
        vars.iter()
            .zip(lambdas)
            .map(|(var, lambda)| self.convert_lambda(lambda, var.clone()))
            .collect()
    }

    /// Evaluate `forms` left to right, handing the resulting atoms to `fk`.
    pub fn t_k_many<'a>(&mut self, forms: &'a [P<IForm>], fk: MetaContMany<'a>) -> Rc<Term> {
        let Some((first, rest)) = forms.split_first() else {
            return fk(self, vec![]);
        };

        self.t_k(
            first,
            Box::new(move |cps: &mut CPSBuilder, first: Atom| {
                if rest.is_empty() {
                    fk(cps, vec![first])
                } else {
                    cps.t_k_many(
                        rest,
                        Box::new(move |cps: &mut CPSBuilder, rest: Vec<Atom>| {
                            fk(cps, std::iter::once(first).chain(rest).collect())
                        }),
                    )
                }
            }),
        )
    }
}

/// Names of the globals assigned anywhere in `form`.
pub fn assigned_globals(form: &IForm) -> HashSet<Symbol> {
    fn walk(form: &IForm, out: &mut HashSet<Symbol>) {
        ensure_stack(|| match form {
            IForm::Const(_) | IForm::Null | IForm::LRef(_) | IForm::GRef(_) => {}
            IForm::GSet(name, value) => {
                out.insert(name.clone());
                walk(value, out);
            }
            IForm::LSet(_, value) | IForm::Field(value, _) => walk(value, out),
            IForm::Lambda(lambda) => walk(&lambda.body, out),
            IForm::App(callee, args) => {
                walk(callee, out);
                args.iter().for_each(|arg| walk(arg, out));
            }
            IForm::PrimApp(_, args) => args.iter().for_each(|arg| walk(arg, out)),
            IForm::If(test, cons, alt) => {
                walk(test, out);
                walk(cons, out);
                walk(alt, out);
            }
            IForm::Let(_, init, body) => {
                walk(init, out);
                walk(body, out);
            }
            IForm::Fix(_, lambdas, body) => {
                lambdas.iter().for_each(|lambda| walk(&lambda.body, out));
                walk(body, out);
            }
            IForm::SetField(object, _, value) => {
                walk(object, out);
                walk(value, out);
            }
        })
    }

    let mut out = HashSet::new();
    walk(form, &mut out);
    out
}

/// Check that every variable reference and assignment is in scope and that
/// no variable is bound twice. CPS conversion reuses the binders of its
/// input, so either problem would produce ill-scoped CPS.
pub fn check_bindings(form: &IForm) -> Result<(), Box<Error>> {
    type Scope = im::HashSet<P<LVar>>;

    fn bind(var: &P<LVar>, seen: &mut HashSet<P<LVar>>) -> Result<(), Box<Error>> {
        if !seen.insert(var.clone()) {
            return Err(Error::invariant(format!("variable {var} is bound twice")));
        }
        Ok(())
    }

    fn in_scope(var: &P<LVar>, scope: &Scope, what: &str) -> Result<(), Box<Error>> {
        if scope.contains(var) {
            Ok(())
        } else {
            Err(Error::invariant(format!("{what} unbound variable {var}")))
        }
    }

    fn walk_lambda(lambda: &Lambda, scope: &Scope, seen: &mut HashSet<P<LVar>>) -> Result<(), Box<Error>> {
        let mut inner = scope.clone();
        for param in &lambda.params {
            bind(param, seen)?;
            inner.insert(param.clone());
        }
        walk(&lambda.body, &inner, seen)
    }

    fn walk(form: &IForm, scope: &Scope, seen: &mut HashSet<P<LVar>>) -> Result<(), Box<Error>> {
        ensure_stack(|| match form {
            IForm::Const(_) | IForm::Null | IForm::GRef(_) => Ok(()),
            IForm::LRef(var) => in_scope(var, scope, "reference to"),
            IForm::LSet(var, value) => {
                in_scope(var, scope, "assignment to")?;
                walk(value, scope, seen)
            }
            IForm::GSet(_, value) | IForm::Field(value, _) => walk(value, scope, seen),
            IForm::Lambda(lambda) => walk_lambda(lambda, scope, seen),
            IForm::App(callee, args) => {
                walk(callee, scope, seen)?;
                args.iter().try_for_each(|arg| walk(arg, scope, seen))
            }
            IForm::PrimApp(_, args) => args.iter().try_for_each(|arg| walk(arg, scope, seen)),
            IForm::If(test, cons, alt) => {
                walk(test, scope, seen)?;
                walk(cons, scope, seen)?;
                walk(alt, scope, seen)
            }
            IForm::Let(var, init, body) => {
                walk(init, scope, seen)?;
                bind(var, seen)?;
                walk(body, &scope.update(var.clone()), seen)
            }
            IForm::Fix(vars, lambdas, body) => {
                if vars.len() != lambdas.len() {
                    return Err(Error::invariant("fix binds a different number of variables and lambdas"));
                }
                let mut inner = scope.clone();
                for var in vars {
                    bind(var, seen)?;
                    inner.insert(var.clone());
                }
                lambdas
                    .iter()
                    .try_for_each(|lambda| walk_lambda(lambda, &inner, seen))?;
                walk(body, &inner, seen)
            }
            IForm::SetField(object, _, value) => {
                walk(object, scope, seen)?;
                walk(value, scope, seen)
            }
        })
    }

    walk(form, &Scope::new(), &mut HashSet::new())
}
