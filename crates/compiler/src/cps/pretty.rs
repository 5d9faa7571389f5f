use crate::il::term::LVar;
use crate::utils::{ensure_stack, with_stack_for};
use ::pretty::BoxAllocator;
use ::pretty::DocAllocator;
use ::pretty::DocBuilder;

use super::term::*;

impl Atom {
    pub fn pretty<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        match self {
            Atom::Constant(lit) => alloc.text(format!("'{lit}")),
            Atom::Null => alloc.text("null"),
            Atom::Global(sym) => alloc.text(format!("(global {sym})")),
            Atom::Local(local) => local.pretty(alloc),
        }
    }
}

impl Func {
    pub fn pretty<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        let name = match &self.name {
            Some(name) => alloc.space() + alloc.text(name.to_string()),
            None => alloc.nil(),
        };

        let args = alloc.space()
            + (self.return_cont.pretty(alloc)
                + if !self.args.is_empty() {
                    alloc.space()
                } else {
                    alloc.nil()
                }
                + alloc.intersperse(self.args.iter().map(|arg| arg.pretty(alloc)), alloc.space()))
            .group()
            .parens();

        (alloc.text("lambda")
            + name
            + args.group()
            + alloc.line()
            + self.body.pretty(alloc).nest(2))
        .nest(2)
        .group()
        .parens()
    }
}

impl Cont {
    pub fn pretty<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        /* (cont <args> <body>) */

        let args = alloc.space()
            + alloc
                .intersperse(self.args.iter().map(|arg| arg.pretty(alloc)), alloc.space())
                .group()
                .parens();

        (alloc.text("cont")
            + args.group()
            + alloc.hardline()
            + self.body.pretty(alloc))
        .parens()
        .group()
    }
}

impl Term {
    pub fn pretty<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        ensure_stack(|| self.pretty_term(alloc))
    }

    fn pretty_term<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        match self {
            Term::App(proc, k, args) => {
                let args_doc =
                    alloc.intersperse(args.iter().map(|arg| arg.pretty(alloc)), alloc.space());
                (proc.pretty(alloc)
                    + alloc.space()
                    + k.pretty(alloc)
                    + if args.is_empty() {
                        alloc.nil()
                    } else {
                        alloc.space()
                    }
                    + args_doc)
                    .group()
                    .parens()
            }

            Term::Continue(k, args) => {
                let args_doc =
                    alloc.intersperse(args.iter().map(|arg| arg.pretty(alloc)), alloc.space());
                (alloc.text("continue ")
                    + k.pretty(alloc)
                    + if args.is_empty() {
                        alloc.nil()
                    } else {
                        alloc.space()
                    }
                    + args_doc)
                    .group()
                    .parens()
            }

            /*
               (fix (
                   [f1 (lambda ...)]
                   [f2 (lambda ...)]
               ) body)
            */
            Term::Fix(funcs, body) => {
                let funcs_doc = alloc.intersperse(
                    funcs.iter().map(|func| {
                        let binding = func.binding.pretty(alloc);
                        let func_doc = func.pretty(alloc);

                        (binding + alloc.softline() + func_doc).group().brackets()
                    }),
                    alloc.line(),
                );

                (alloc.text("fix")
                    + alloc.space()
                    + funcs_doc.parens()
                    + alloc.line()
                    + body.pretty(alloc))
                .parens()
            }

            Term::Let(var, expr, body) => (alloc.text("let")
                + alloc.space()
                + (var.pretty(alloc) + alloc.space() + expr.pretty(alloc)).brackets()
                + alloc.hardline()
                + body.pretty(alloc))
            .group()
            .parens(),

            Term::If(test, cons, alt) => (alloc.text("if")
                + alloc.space()
                + test.pretty(alloc)
                + alloc.space()
                + cons.pretty(alloc)
                + alloc.space()
                + alt.pretty(alloc))
            .group()
            .parens(),

            /*
               (letk (
                   [c1 (cont ...)]
                   [c2 (cont ...)]
               ) body)
            */
            Term::Letk(conts, body) => {
                let conts_doc = alloc.intersperse(
                    conts.iter().map(|cont| {
                        let binding = cont.binding.pretty(alloc);
                        let cont_doc = cont.pretty(alloc);

                        (binding + alloc.softline() + cont_doc).group().brackets()
                    }),
                    alloc.line(),
                );

                (alloc.text("letk")
                    + alloc.space()
                    + conts_doc.parens()
                    + alloc.line()
                    + body.pretty(alloc))
                .parens()
            }
        }
    }
}

impl LVar {
    pub fn pretty<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        alloc.text(self.to_string())
    }
}

impl Expression {
    pub fn pretty<'a, D, A>(&self, alloc: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: 'a + Clone,
    {
        let form = |head: &str, args: Vec<DocBuilder<'a, D, A>>| {
            (alloc.text(head.to_owned())
                + alloc.space()
                + alloc.intersperse(args, alloc.space()))
            .group()
            .parens()
        };
        match self {
            Expression::Field(object, name) => {
                form("field", vec![object.pretty(alloc), alloc.text(name.to_string())])
            }
            Expression::SetField(object, name, value) => form(
                "set-field",
                vec![
                    object.pretty(alloc),
                    alloc.text(name.to_string()),
                    value.pretty(alloc),
                ],
            ),
            Expression::Global(name) => form("global-ref", vec![alloc.text(name.to_string())]),
            Expression::SetGlobal(name, value) => form(
                "set-global",
                vec![alloc.text(name.to_string()), value.pretty(alloc)],
            ),
            Expression::PrimCall(prim, args) => {
                form(prim.name(), args.iter().map(|arg| arg.pretty(alloc)).collect())
            }
        }
    }
}

/// Render `func` as text, breaking lines to fit in `width` columns where
/// possible. The output depends only on the structure of `func`.
///
/// Bodies of `let`, `letk`, `fix` and continuations are not indented, so
/// indentation grows with lambda nesting only.
pub fn render(func: &Func, width: usize) -> String {
    with_stack_for(func.body.size(), || {
        let mut out = String::new();
        let doc = func.pretty::<_, ()>(&BoxAllocator);
        // writing into a String cannot fail
        let _ = doc.1.render_fmt(width, &mut out);
        out
    })
}
