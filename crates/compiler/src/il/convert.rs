//! Lowering of parser output into [`IForm`]s.

use std::collections::HashSet;

use im::HashMap;

use crate::{
    ast::{Literal, P, Symbol, Syntax},
    error::Error,
    il::term::{IForm, LVar, Lambda},
    utils::ensure_stack,
};

type Scope = HashMap<Symbol, P<LVar>>;

/// Lower a program (a body of forms) into a single [`IForm`].
pub fn convert(program: &[Syntax]) -> Result<P<IForm>, Box<Error>> {
    let mut converter = Converter::new();
    let form = converter.body(program, &Scope::new())?;
    log::debug!(
        "converted {} top-level forms into {} IR nodes ({} variables)",
        program.len(),
        form.size(),
        converter.varcount
    );
    Ok(form)
}

pub struct Converter {
    varcount: u32,
    /// Variables read or assigned anywhere so far.
    referenced: HashSet<P<LVar>>,
    /// Variables that are the target of an assignment.
    mutated: HashSet<P<LVar>>,
}

fn lref(var: &P<LVar>) -> P<IForm> {
    P(IForm::LRef(var.clone()))
}

/// `object.method(args...)`
fn method_call(object: &P<LVar>, method: &str, args: Vec<P<IForm>>) -> P<IForm> {
    P(IForm::App(P(IForm::Field(lref(object), Symbol::new(method))), args))
}

impl Converter {
    pub fn new() -> Self {
        Converter {
            varcount: 0,
            referenced: HashSet::new(),
            mutated: HashSet::new(),
        }
    }

    fn fresh_variable(&mut self, name: Symbol) -> P<LVar> {
        let var = LVar::new(name, self.varcount);
        self.varcount += 1;
        var
    }

    fn binder_name(name: &str) -> Result<Symbol, Box<Error>> {
        if name.is_empty() {
            return Err(Error::malformed("expected variable name"));
        }
        Ok(Symbol::new(name))
    }

    /// Lower a sequence of body forms. Every form but the last is bound, the
    /// last one supplies the value. A definition scopes over its own
    /// initializer and the rest of the body.
    ///
    /// A defined lambda that is never assigned becomes a `Fix`. Any other
    /// initializer that refers to its own name sees the variable as null
    /// until the initializer's value is stored into it.
    pub fn body(&mut self, forms: &[Syntax], scope: &Scope) -> Result<P<IForm>, Box<Error>> {
        ensure_stack(|| match forms.split_first() {
            None => Ok(P(IForm::Null)),

            Some((Syntax::Define { name, value }, rest)) => {
                let name = Self::binder_name(name)?;
                let var = self.fresh_variable(name.clone());
                let scope = scope.update(name.clone(), var.clone());

                let init = self.expr_named(value, &scope, Some(&name))?;
                let recursive = self.referenced.contains(&var);

                let body = if rest.is_empty() {
                    lref(&var)
                } else {
                    self.body(rest, &scope)?
                };

                let lambda = match &*init {
                    IForm::Lambda(lambda) if !self.mutated.contains(&var) => Some(lambda.clone()),
                    _ => None,
                };

                let form = if let Some(lambda) = lambda {
                    IForm::Fix(vec![var], vec![lambda], body)
                } else if recursive {
                    self.mutated.insert(var.clone());
                    let seq = self.fresh_variable(Symbol::new("seq"));
                    let store = P(IForm::LSet(var.clone(), init));
                    IForm::Let(var, P(IForm::Null), P(IForm::Let(seq, store, body)))
                } else {
                    IForm::Let(var, init, body)
                };
                Ok(P(form))
            }

            Some((form, [])) => self.expr(form, scope),

            Some((form, rest)) => {
                let form = self.expr(form, scope)?;
                let tmp = self.fresh_variable(Symbol::new("seq"));
                let body = self.body(rest, scope)?;
                Ok(P(IForm::Let(tmp, form, body)))
            }
        })
    }

    pub fn expr(&mut self, form: &Syntax, scope: &Scope) -> Result<P<IForm>, Box<Error>> {
        self.expr_named(form, scope, None)
    }

    fn expr_named(
        &mut self,
        form: &Syntax,
        scope: &Scope,
        name: Option<&Symbol>,
    ) -> Result<P<IForm>, Box<Error>> {
        ensure_stack(|| {
            let term = match form {
                Syntax::Int(i) => IForm::Const(Literal::Int(*i)),
                Syntax::Float(x) => IForm::Const(Literal::Float(*x)),
                Syntax::Str(s) => IForm::Const(Literal::Str(s.as_str().into())),
                Syntax::Bytes(b) => IForm::Const(Literal::Bytes(b.as_slice().into())),
                Syntax::Bool(b) => IForm::Const(Literal::Bool(*b)),
                Syntax::Null => IForm::Null,

                Syntax::Ident(ident) => {
                    let sym = Self::binder_name(ident)?;
                    match scope.get(&sym) {
                        Some(var) => {
                            self.referenced.insert(var.clone());
                            IForm::LRef(var.clone())
                        }
                        None => IForm::GRef(sym),
                    }
                }

                Syntax::Assign { target, value } => return self.assign(target, value, scope),

                Syntax::Lambda { params, body } => {
                    let mut inner = scope.clone();
                    let mut vars: Vec<P<LVar>> = Vec::with_capacity(params.len());
                    for param in params {
                        let sym = Self::binder_name(param)?;
                        if vars.iter().any(|var| var.name == sym) {
                            return Err(Error::malformed(format!("duplicate parameter `{sym}`")));
                        }
                        let var = self.fresh_variable(sym.clone());
                        inner.insert(sym, var.clone());
                        vars.push(var);
                    }
                    let body = self.body(body, &inner)?;
                    IForm::Lambda(P(Lambda {
                        name: name.cloned(),
                        params: vars,
                        body,
                    }))
                }

                Syntax::Call { callee, args } => {
                    let callee = self.expr(callee, scope)?;
                    let args = args
                        .iter()
                        .map(|arg| self.expr(arg, scope))
                        .collect::<Result<Vec<_>, _>>()?;
                    IForm::App(callee, args)
                }

                Syntax::If {
                    test,
                    then,
                    otherwise,
                } => {
                    let test = self.expr(test, scope)?;
                    let then = self.expr(then, scope)?;
                    let otherwise = match otherwise {
                        Some(alt) => self.expr(alt, scope)?,
                        None => P(IForm::Null),
                    };
                    IForm::If(test, then, otherwise)
                }

                Syntax::Seq(forms) => return self.body(forms, scope),

                Syntax::Define { name, .. } => {
                    return Err(Error::malformed(format!(
                        "definition of `{name}` outside of a body"
                    )));
                }

                Syntax::Field { object, name } => {
                    let object = self.expr(object, scope)?;
                    if name.is_empty() {
                        return Err(Error::malformed("expected field name"));
                    }
                    IForm::Field(object, Symbol::new(name))
                }

                // o[i] => let o = <object>; let i = <index>; o.~index(i)
                Syntax::Index { object, index } => {
                    let object = self.expr(object, scope)?;
                    let index = self.expr(index, scope)?;
                    let o = self.fresh_variable(Symbol::new("obj"));
                    let i = self.fresh_variable(Symbol::new("idx"));
                    let call = method_call(&o, "~index", vec![lref(&i)]);
                    IForm::Let(o, object, P(IForm::Let(i, index, call)))
                }

                Syntax::Array(items) => {
                    let items = items
                        .iter()
                        .map(|item| self.expr(item, scope))
                        .collect::<Result<Vec<_>, _>>()?;
                    IForm::App(P(IForm::GRef(Symbol::new("Array"))), items)
                }

                // { k: v, ... } => let d = Dictionary(); d.~update(k, v); ...; d
                Syntax::Dict(entries) => {
                    let dict = self.fresh_variable(Symbol::new("dict"));
                    let mut updates = Vec::with_capacity(entries.len());
                    for (key, value) in entries {
                        let key = (self.fresh_variable(Symbol::new("key")), self.expr(key, scope)?);
                        let value = (self.fresh_variable(Symbol::new("val")), self.expr(value, scope)?);
                        updates.push((key, value, self.fresh_variable(Symbol::new("seq"))));
                    }

                    let mut body = lref(&dict);
                    for ((k, key), (v, value), seq) in updates.into_iter().rev() {
                        let update = method_call(&dict, "~update", vec![lref(&k), lref(&v)]);
                        body = P(IForm::Let(
                            k,
                            key,
                            P(IForm::Let(v, value, P(IForm::Let(seq, update, body)))),
                        ));
                    }

                    let ctor = P(IForm::App(P(IForm::GRef(Symbol::new("Dictionary"))), vec![]));
                    IForm::Let(dict, ctor, body)
                }
            };

            Ok(P(term))
        })
    }

    /// Lower an assignment. The value is evaluated first, then the target's
    /// object and index, and the whole form yields the value.
    fn assign(&mut self, target: &Syntax, value: &Syntax, scope: &Scope) -> Result<P<IForm>, Box<Error>> {
        let form = match target {
            Syntax::Ident(ident) => {
                let sym = Self::binder_name(ident)?;
                let value = self.expr(value, scope)?;
                match scope.get(&sym) {
                    Some(var) => {
                        self.referenced.insert(var.clone());
                        self.mutated.insert(var.clone());
                        IForm::LSet(var.clone(), value)
                    }
                    None => IForm::GSet(sym, value),
                }
            }

            // o.name = v => let v = <value>; o.name = v
            Syntax::Field { object, name } => {
                if name.is_empty() {
                    return Err(Error::malformed("expected field name"));
                }
                let value = self.expr(value, scope)?;
                let object = self.expr(object, scope)?;
                let v = self.fresh_variable(Symbol::new("val"));
                let store = P(IForm::SetField(object, Symbol::new(name), lref(&v)));
                IForm::Let(v, value, store)
            }

            // o[i] = v => let v = <value>; let o = <object>; let i = <index>; o.~update(i, v); v
            Syntax::Index { object, index } => {
                let value = self.expr(value, scope)?;
                let object = self.expr(object, scope)?;
                let index = self.expr(index, scope)?;
                let v = self.fresh_variable(Symbol::new("val"));
                let o = self.fresh_variable(Symbol::new("obj"));
                let i = self.fresh_variable(Symbol::new("idx"));
                let seq = self.fresh_variable(Symbol::new("seq"));
                let update = method_call(&o, "~update", vec![lref(&i), lref(&v)]);
                let store = P(IForm::Let(seq, update, lref(&v)));
                IForm::Let(
                    v,
                    value,
                    P(IForm::Let(o, object, P(IForm::Let(i, index, store)))),
                )
            }

            _ => {
                return Err(Error::malformed(
                    "left-hand side of an assignment must be a variable, field, or index",
                ));
            }
        };
        Ok(P(form))
    }
}
