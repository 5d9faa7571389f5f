//! Continuation-passing style IR.
//!
//! [`IForm`](crate::il::term::IForm) is lowered to CPS by [`transform`], simplified by
//! [`cleanup`] and printed by [`render`].

use crate::{
    ast::P,
    error::Error,
    il::{assignment_elimination, term::IForm},
};

pub mod convert;
pub mod optimizer;
pub mod pretty;
pub mod term;
pub mod verify;

pub use pretty::render;

/// Convert a whole program into a single function of no arguments whose
/// return continuation receives the program's value.
///
/// Assigned local variables are boxed first, so the CPS never mutates a
/// binding.
pub fn transform(form: &IForm) -> Result<P<term::Func>, Box<Error>> {
    convert::check_bindings(form)?;
    let form = assignment_elimination(&P(form.clone()))?;
    let first_id = form.max_var_id().map_or(0, |id| id + 1);
    let func = convert::CPSBuilder::new(first_id)
        .assigned_globals(convert::assigned_globals(&form))
        .convert_toplevel(&form)?;
    log::debug!("converted to CPS: {} terms", func.body.size());
    Ok(func)
}

/// Simplify `func` until no rule applies.
pub fn cleanup(func: &P<term::Func>) -> Result<P<term::Func>, Box<Error>> {
    optimizer::rewrite(func, None)
}

/// Like [`cleanup`], but gives up after `max_passes` passes.
pub fn cleanup_bounded(func: &P<term::Func>, max_passes: usize) -> Result<P<term::Func>, Box<Error>> {
    optimizer::rewrite(func, Some(max_passes))
}
