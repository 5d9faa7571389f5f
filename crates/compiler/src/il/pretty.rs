use pretty::{DocAllocator, DocBuilder};

use crate::utils::{ensure_stack, with_stack_for};

use super::term::*;

/// `(head item ...)`, breaking between items when it does not fit.
fn list<'b, D, A>(
    allocator: &'b D,
    head: DocBuilder<'b, D, A>,
    items: impl IntoIterator<Item = DocBuilder<'b, D, A>>,
) -> DocBuilder<'b, D, A>
where
    D: DocAllocator<'b, A>,
    D::Doc: Clone,
    A: Clone,
{
    head.append(allocator.concat(items.into_iter().map(|item| allocator.line().append(item))))
        .nest(2)
        .group()
        .parens()
}

fn lambda_doc<'b, D, A>(allocator: &'b D, lambda: &'b Lambda) -> DocBuilder<'b, D, A>
where
    D: DocAllocator<'b, A>,
    D::Doc: Clone,
    A: Clone,
{
    let name = match &lambda.name {
        Some(name) => allocator.space().append(allocator.text(name.to_string())),
        None => allocator.nil(),
    };
    allocator
        .text("lambda")
        .append(name)
        .append(allocator.space())
        .append(
            allocator
                .intersperse(
                    lambda.params.iter().map(|p| allocator.text(p.to_string())),
                    allocator.space(),
                )
                .parens(),
        )
        .append(allocator.line())
        .append(lambda.body.pretty(allocator))
        .nest(2)
        .group()
        .parens()
}

impl IForm {
    pub fn pretty<'b, D, A>(&'b self, allocator: &'b D) -> DocBuilder<'b, D, A>
    where
        D: DocAllocator<'b, A>,
        D::Doc: Clone,
        A: Clone,
    {
        ensure_stack(|| self.p(allocator))
    }

    fn p<'b, D, A>(&'b self, allocator: &'b D) -> DocBuilder<'b, D, A>
    where
        D: DocAllocator<'b, A>,
        D::Doc: Clone,
        A: Clone,
    {
        match self {
            IForm::Const(lit) => allocator
                .text("const")
                .append(allocator.space())
                .append(allocator.text(lit.to_string()))
                .group()
                .parens(),

            IForm::Null => allocator.text("null"),

            IForm::LRef(lref) => allocator.text(lref.to_string()),
            IForm::GRef(gref) => allocator
                .text("gref")
                .append(allocator.space())
                .append(allocator.text(gref.to_string()))
                .group()
                .parens(),

            IForm::If(test, cons, alt) => allocator
                .text("if")
                .append(allocator.space())
                .append(test.pretty(allocator))
                .append(allocator.line())
                .append(cons.pretty(allocator))
                .append(allocator.line())
                .append(alt.pretty(allocator))
                .nest(2)
                .group()
                .parens(),

            IForm::App(proc, args) => {
                let mut builder = allocator
                    .text("call")
                    .append(allocator.space())
                    .append(proc.pretty(allocator))
                    .nest(2);
                if !args.is_empty() {
                    builder = builder.append(allocator.softline());
                }
                builder = builder
                    .append(
                        allocator.intersperse(
                            args.iter().map(|x| x.pretty(allocator)),
                            allocator.softline(),
                        ),
                    )
                    .nest(2);
                builder.group().parens()
            }

            IForm::Let(var, init, body) => allocator
                .text("let")
                .append(allocator.space())
                .append(
                    allocator
                        .text(var.to_string())
                        .append(allocator.space())
                        .append(init.pretty(allocator))
                        .group()
                        .brackets(),
                )
                .append(allocator.hardline())
                .append(body.pretty(allocator))
                .parens(),

            IForm::Fix(vars, lambdas, body) => allocator
                .text("fix")
                .append(allocator.space())
                .append(
                    allocator
                        .intersperse(
                            vars.iter().zip(lambdas).map(|(var, lambda)| {
                                allocator
                                    .text(var.to_string())
                                    .append(allocator.space())
                                    .append(lambda_doc(allocator, lambda))
                                    .nest(2)
                                    .group()
                                    .brackets()
                            }),
                            allocator.hardline(),
                        )
                        .parens(),
                )
                .append(allocator.hardline())
                .append(body.pretty(allocator))
                .parens(),

            IForm::Lambda(lambda) => lambda_doc(allocator, lambda),

            IForm::LSet(var, value) => list(
                allocator,
                allocator.text("set!"),
                [allocator.text(var.to_string()), value.pretty(allocator)],
            ),

            IForm::GSet(name, value) => list(
                allocator,
                allocator.text("gset"),
                [allocator.text(name.to_string()), value.pretty(allocator)],
            ),

            IForm::PrimApp(prim, args) => list(
                allocator,
                allocator.text(prim.name()),
                args.iter().map(|arg| arg.pretty(allocator)),
            ),

            IForm::SetField(object, name, value) => list(
                allocator,
                allocator.text("set-field"),
                [
                    object.pretty(allocator),
                    allocator.text(name.to_string()),
                    value.pretty(allocator),
                ],
            ),

            IForm::Field(object, name) => allocator
                .text("field")
                .append(allocator.space())
                .append(object.pretty(allocator))
                .append(allocator.space())
                .append(allocator.text(name.to_string()))
                .group()
                .parens(),
        }
    }

    /// Render the form for logs and test output.
    pub fn to_pretty_string(&self, width: usize) -> String {
        // the document is as deep as the form and is dropped recursively
        with_stack_for(self.size(), || {
            let mut out = String::new();
            let doc = self.pretty::<_, ()>(&pretty::BoxAllocator);
            // writing into a String cannot fail
            let _ = doc.1.render_fmt(width, &mut out);
            out
        })
    }
}
