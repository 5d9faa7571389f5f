//! Assignment Elimination
//!
//! Removes `LSet` forms from the IL. Every assigned variable is bound to a
//! box right after its binder, reads of it become `unbox` and assignments
//! become `box-set!`.

use std::collections::{HashMap, HashSet};

use crate::{
    ast::{P, Symbol},
    error::Error,
    il::term::{IForm, LVar, Lambda, Prim},
    utils::ensure_stack,
};

pub fn assignment_elimination(form: &P<IForm>) -> Result<P<IForm>, Box<Error>> {
    let mut mutated = HashSet::new();
    collect_mutated(form, &mut mutated);
    if mutated.is_empty() {
        return Ok(form.clone());
    }

    let mut pass = Boxing {
        mutated,
        subst: HashMap::new(),
        varcount: form.max_var_id().map_or(0, |id| id + 1),
    };
    let form = pass.rewrite(form)?;
    log::debug!("boxed {} assigned variables", pass.subst.len());
    Ok(form)
}

fn collect_mutated(form: &IForm, out: &mut HashSet<P<LVar>>) {
    ensure_stack(|| match form {
        IForm::Const(_) | IForm::Null | IForm::LRef(_) | IForm::GRef(_) => {}
        IForm::LSet(var, value) => {
            out.insert(var.clone());
            collect_mutated(value, out);
        }
        IForm::GSet(_, value) | IForm::Field(value, _) => collect_mutated(value, out),
        IForm::Lambda(lambda) => collect_mutated(&lambda.body, out),
        IForm::App(callee, args) => {
            collect_mutated(callee, out);
            args.iter().for_each(|arg| collect_mutated(arg, out));
        }
        IForm::PrimApp(_, args) => args.iter().for_each(|arg| collect_mutated(arg, out)),
        IForm::If(test, cons, alt) => {
            collect_mutated(test, out);
            collect_mutated(cons, out);
            collect_mutated(alt, out);
        }
        IForm::Let(_, init, body) => {
            collect_mutated(init, out);
            collect_mutated(body, out);
        }
        IForm::Fix(_, lambdas, body) => {
            lambdas.iter().for_each(|l| collect_mutated(&l.body, out));
            collect_mutated(body, out);
        }
        IForm::SetField(object, _, value) => {
            collect_mutated(object, out);
            collect_mutated(value, out);
        }
    })
}

struct Boxing {
    mutated: HashSet<P<LVar>>,
    /// Assigned variable to the variable holding its box.
    subst: HashMap<P<LVar>, P<LVar>>,
    varcount: u32,
}

fn prim(op: Prim, args: Vec<P<IForm>>) -> P<IForm> {
    P(IForm::PrimApp(op, args))
}

fn lref(var: &P<LVar>) -> P<IForm> {
    P(IForm::LRef(var.clone()))
}

impl Boxing {
    /// Allocate the box variable for `var` and remember the substitution.
    fn box_for(&mut self, var: &P<LVar>) -> P<LVar> {
        let boxed = LVar::new(Symbol::new(&format!("&{}", var.name)), self.varcount);
        self.varcount += 1;
        self.subst.insert(var.clone(), boxed.clone());
        boxed
    }

    fn rewrite_all(&mut self, forms: &[P<IForm>]) -> Result<Vec<P<IForm>>, Box<Error>> {
        forms.iter().map(|form| self.rewrite(form)).collect()
    }

    fn rewrite_lambda(&mut self, lambda: &P<Lambda>) -> Result<P<Lambda>, Box<Error>> {
        let assigned = lambda
            .params
            .iter()
            .filter(|param| self.mutated.contains(*param))
            .cloned()
            .collect::<Vec<_>>();
        let boxed = assigned
            .into_iter()
            .map(|param| {
                let boxed = self.box_for(&param);
                (param, boxed)
            })
            .collect::<Vec<_>>();

        let mut body = self.rewrite(&lambda.body)?;
        for (param, boxed) in boxed.into_iter().rev() {
            body = P(IForm::Let(boxed, prim(Prim::Box, vec![lref(&param)]), body));
        }

        Ok(P(Lambda {
            name: lambda.name.clone(),
            params: lambda.params.clone(),
            body,
        }))
    }

    fn rewrite(&mut self, form: &P<IForm>) -> Result<P<IForm>, Box<Error>> {
        ensure_stack(|| {
            let term = match &**form {
                IForm::Const(_) | IForm::Null | IForm::GRef(_) => return Ok(form.clone()),

                IForm::LRef(var) => match self.subst.get(var) {
                    Some(boxed) => return Ok(prim(Prim::Unbox, vec![lref(boxed)])),
                    None => return Ok(form.clone()),
                },

                IForm::LSet(var, value) => {
                    let Some(boxed) = self.subst.get(var).cloned() else {
                        return Err(Error::invariant(format!(
                            "assignment to `{var}` outside the scope of its box"
                        )));
                    };
                    let value = self.rewrite(value)?;
                    return Ok(prim(Prim::BoxSet, vec![lref(&boxed), value]));
                }

                IForm::GSet(name, value) => IForm::GSet(name.clone(), self.rewrite(value)?),
                IForm::Lambda(lambda) => IForm::Lambda(self.rewrite_lambda(lambda)?),
                IForm::App(callee, args) => IForm::App(self.rewrite(callee)?, self.rewrite_all(args)?),
                IForm::PrimApp(op, args) => IForm::PrimApp(*op, self.rewrite_all(args)?),
                IForm::If(test, cons, alt) => {
                    IForm::If(self.rewrite(test)?, self.rewrite(cons)?, self.rewrite(alt)?)
                }

                IForm::Let(var, init, body) => {
                    let init = self.rewrite(init)?;
                    if self.mutated.contains(var) {
                        let boxed = self.box_for(var);
                        let body = self.rewrite(body)?;
                        let body = P(IForm::Let(boxed, prim(Prim::Box, vec![lref(var)]), body));
                        IForm::Let(var.clone(), init, body)
                    } else {
                        IForm::Let(var.clone(), init, self.rewrite(body)?)
                    }
                }

                IForm::Fix(vars, lambdas, body) => {
                    if let Some(var) = vars.iter().find(|var| self.mutated.contains(*var)) {
                        return Err(Error::invariant(format!(
                            "assignment to recursively bound `{var}`"
                        )));
                    }
                    let lambdas = lambdas
                        .iter()
                        .map(|lambda| self.rewrite_lambda(lambda))
                        .collect::<Result<Vec<_>, _>>()?;
                    IForm::Fix(vars.clone(), lambdas, self.rewrite(body)?)
                }

                IForm::Field(object, name) => IForm::Field(self.rewrite(object)?, name.clone()),
                IForm::SetField(object, name, value) => {
                    IForm::SetField(self.rewrite(object)?, name.clone(), self.rewrite(value)?)
                }
            };
            Ok(P(term))
        })
    }
}
