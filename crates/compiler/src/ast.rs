//! Syntax trees handed to the middle-end by the parser, plus the small value
//! types (symbols and literals) that are shared by every IR.

use std::{fmt, rc::Rc};

pub type P<T> = Rc<T>;

#[allow(non_snake_case)]
pub fn P<T>(value: T) -> P<T> {
    P::new(value)
}

/// A name. Symbols compare by content; identity of bindings is tracked by
/// [`LVar`](crate::il::term::LVar), never by the symbol itself.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Rc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Rc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Constant values. Null is deliberately absent: it is a separate case in
/// every IR rather than a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Bool(bool),
}

impl Literal {
    pub fn is_falsy(&self) -> bool {
        matches!(self, Literal::Bool(false))
    }

    /// Equality used by tree comparison: floats compare bitwise so that a
    /// `NaN` constant is equal to itself.
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Str(s) => write!(f, "{s:?}"),
            Literal::Bytes(b) => write!(f, "b\"{}\"", b.escape_ascii()),
            Literal::Bool(true) => write!(f, "true"),
            Literal::Bool(false) => write!(f, "false"),
        }
    }
}

/// Parser output.
///
/// `Define` is a body form: it may only appear directly in a program, a
/// lambda body or a `Seq`. Its name scopes over its own initializer and the
/// forms after it.
///
/// `Assign` stores into a variable, a field or an index and yields the stored
/// value. Any other target is rejected during conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum Syntax {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Null,
    Ident(String),
    Lambda {
        params: Vec<String>,
        body: Vec<Syntax>,
    },
    Call {
        callee: Box<Syntax>,
        args: Vec<Syntax>,
    },
    If {
        test: Box<Syntax>,
        then: Box<Syntax>,
        otherwise: Option<Box<Syntax>>,
    },
    Seq(Vec<Syntax>),
    Define {
        name: String,
        value: Box<Syntax>,
    },
    Field {
        object: Box<Syntax>,
        name: String,
    },
    Index {
        object: Box<Syntax>,
        index: Box<Syntax>,
    },
    Assign {
        target: Box<Syntax>,
        value: Box<Syntax>,
    },
    Array(Vec<Syntax>),
    Dict(Vec<(Syntax, Syntax)>),
}

impl Syntax {
    pub fn ident(name: &str) -> Self {
        Syntax::Ident(name.to_owned())
    }

    pub fn call(callee: Syntax, args: Vec<Syntax>) -> Self {
        Syntax::Call {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn lambda(params: &[&str], body: Vec<Syntax>) -> Self {
        Syntax::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        }
    }

    pub fn define(name: &str, value: Syntax) -> Self {
        Syntax::Define {
            name: name.to_owned(),
            value: Box::new(value),
        }
    }

    pub fn assign(target: Syntax, value: Syntax) -> Self {
        Syntax::Assign {
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn if_(test: Syntax, then: Syntax, otherwise: Option<Syntax>) -> Self {
        Syntax::If {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: otherwise.map(Box::new),
        }
    }
}
