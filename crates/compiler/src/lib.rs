#![allow(clippy::type_complexity, clippy::new_without_default)]

pub mod ast;
pub mod cps;
pub mod error;
pub mod il;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::Error;

use crate::ast::Syntax;

/// Knobs for [`compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Target line width of the rendered output.
    pub width: usize,
    /// Stack reserved for the whole pipeline. Passes are recursive in the
    /// nesting depth of the program.
    pub stack_size: usize,
    /// Upper bound on cleanup passes; `None` runs cleanup to a fixed point.
    pub max_cleanup_passes: Option<usize>,
    /// Check CPS well-formedness after conversion and after cleanup.
    pub verify: bool,
    /// Run cleanup at all. When false the converted CPS is rendered as is.
    pub cleanup: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            width: 70,
            stack_size: 64 * 1024 * 1024,
            max_cleanup_passes: None,
            verify: true,
            cleanup: true,
        }
    }
}

impl Options {
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn max_cleanup_passes(mut self, passes: Option<usize>) -> Self {
        self.max_cleanup_passes = passes;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }
}

/// Run the whole middle-end over `program` and render the result.
pub fn compile(program: &[Syntax], options: &Options) -> Result<String, Box<Error>> {
    let result = stacker::grow(options.stack_size, || compile_on_stack(program, options));
    if let Err(err) = &result {
        log::error!("compilation failed: {err}");
    }
    result
}

fn compile_on_stack(program: &[Syntax], options: &Options) -> Result<String, Box<Error>> {
    let form = il::convert(program)?;
    log::trace!("IL:\n{}", form.to_pretty_string(options.width));

    let mut func = cps::transform(&form)?;
    if options.verify {
        cps::verify::verify(&func)?;
    }

    if options.cleanup {
        func = cps::optimizer::rewrite(&func, options.max_cleanup_passes)?;
        if options.verify {
            cps::verify::verify(&func)?;
        }
    }

    let out = cps::render(&func, options.width);
    log::trace!("CPS:\n{out}");
    Ok(out)
}
