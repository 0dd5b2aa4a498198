use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::rc::Rc;

// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<T>;

// Where a node came from in the original source. The front end fills
// this in; diagnostics print it as file:line:col.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub fn new(line: u32, col: u32) -> SourceLoc {
        SourceLoc { line, col }
    }
}

// Arithmetic, comparison, and logic operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    And,
    Or,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
}

// The interrogative family: `what is x` and friends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    What,
    Why,
    How,
    When,
    Where,
    Who,
}

// The predicate family. Applied to a name (`x is converged`) or,
// with no target, to the process-wide tracker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateKind {
    Converged,
    Stable,
    Diverging,
    Oscillating,
    Improving,
    Equilibrium,
    Stuck,
    Chaotic,
    Settled,
    Balanced,
}

// ADT for expressions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Id(String),
    List(Seq<Expr>),
    Binary(BinOp, Node<Expr>, Node<Expr>),
    Unary(UnOp, Node<Expr>),
    Call(String, Seq<Expr>),
    Index(Node<Expr>, Node<Expr>),
    Slice(Node<Expr>, Node<Expr>, Node<Expr>),
    Question(QuestionKind, String),
    Predicate(PredicateKind, Option<String>),
}

// ADT for statements
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Assign {
        name: String,
        value: Expr,
        #[serde(default)]
        loc: SourceLoc,
    },
    // A call evaluated for its effect, like `print of x`.
    Expr {
        value: Expr,
        #[serde(default)]
        loc: SourceLoc,
    },
    FunctionDef {
        name: String,
        #[serde(default)]
        params: Vec<String>,
        body: Seq<Stmt>,
        #[serde(default)]
        loc: SourceLoc,
    },
    Return {
        #[serde(default)]
        value: Option<Expr>,
        #[serde(default)]
        loc: SourceLoc,
    },
    If {
        cond: Expr,
        then: Seq<Stmt>,
        #[serde(default)]
        otherwise: Seq<Stmt>,
        #[serde(default)]
        loc: SourceLoc,
    },
    While {
        cond: Expr,
        body: Seq<Stmt>,
        #[serde(default)]
        loc: SourceLoc,
    },
    ForIn {
        name: String,
        iter: Expr,
        body: Seq<Stmt>,
        #[serde(default)]
        loc: SourceLoc,
    },
    Break {
        #[serde(default)]
        loc: SourceLoc,
    },
    Continue {
        #[serde(default)]
        loc: SourceLoc,
    },
    Import {
        module: String,
        #[serde(default)]
        loc: SourceLoc,
    },
}

impl Stmt {
    pub fn loc(&self) -> SourceLoc {
        match self {
            Stmt::Assign { loc, .. }
            | Stmt::Expr { loc, .. }
            | Stmt::FunctionDef { loc, .. }
            | Stmt::Return { loc, .. }
            | Stmt::If { loc, .. }
            | Stmt::While { loc, .. }
            | Stmt::ForIn { loc, .. }
            | Stmt::Break { loc }
            | Stmt::Continue { loc }
            | Stmt::Import { loc, .. } => *loc,
        }
    }
}

// What the front end hands the driver: the module name, the
// resolver's observed-variable set, and the program tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleDoc {
    pub module: String,
    #[serde(default)]
    pub observed: BTreeSet<String>,
    pub program: Seq<Stmt>,
}

// Tree constructors. The front end is external; these exist so the
// driver's own tests (and embedders) can build programs without
// writing RON by hand.
pub mod build {
    use super::*;

    pub fn num(v: f64) -> Expr {
        Expr::Number(v)
    }

    pub fn id(name: &str) -> Expr {
        Expr::Id(String::from(name))
    }

    pub fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::Binary(op, Node::new(l), Node::new(r))
    }

    pub fn call(fn_name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(String::from(fn_name), args)
    }

    pub fn index(target: Expr, idx: Expr) -> Expr {
        Expr::Index(Node::new(target), Node::new(idx))
    }

    pub fn assign(name: &str, value: Expr) -> Stmt {
        Stmt::Assign {
            name: String::from(name),
            value,
            loc: SourceLoc::default(),
        }
    }

    pub fn expr(value: Expr) -> Stmt {
        Stmt::Expr {
            value,
            loc: SourceLoc::default(),
        }
    }

    pub fn ret(value: Expr) -> Stmt {
        Stmt::Return {
            value: Some(value),
            loc: SourceLoc::default(),
        }
    }

    pub fn doc(module: &str, observed: &[&str], program: Seq<Stmt>) -> ModuleDoc {
        ModuleDoc {
            module: String::from(module),
            observed: observed.iter().map(|s| String::from(*s)).collect(),
            program,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    #[test]
    fn documents_round_trip_through_ron() {
        let doc = doc(
            "main",
            &["guess"],
            vec![
                assign("guess", num(50.0)),
                expr(call("print", vec![id("guess")])),
            ],
        );
        let text = ron::ser::to_string(&doc).unwrap();
        let back: ModuleDoc = ron::de::from_str(&text).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn loc_defaults_when_omitted() {
        let text = r#"(
            module: "m",
            program: [
                Assign(name: "x", value: Number(1.0)),
            ],
        )"#;
        let doc: ModuleDoc = ron::de::from_str(text).unwrap();
        assert_eq!(doc.program[0].loc(), SourceLoc::default());
        assert!(doc.observed.is_empty());
    }

    #[test]
    fn predicates_parse_with_and_without_targets() {
        let scoped: Expr = ron::de::from_str(r#"Predicate(Converged, Some("x"))"#).unwrap();
        assert_eq!(
            scoped,
            Expr::Predicate(PredicateKind::Converged, Some(String::from("x")))
        );
        let unscoped: Expr = ron::de::from_str("Predicate(Oscillating, None)").unwrap();
        assert_eq!(unscoped, Expr::Predicate(PredicateKind::Oscillating, None));
    }
}
