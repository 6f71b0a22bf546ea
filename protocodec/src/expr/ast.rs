//! Expression AST.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// A node reference string carries this sentinel prefix after the
/// preprocessor rewrites `#id` / `#proto:id` into a string literal (the
/// reference preprocessor). It lets the evaluator tell a genuine
/// quoted literal (e.g. the `'md5'` algorithm tag in `hashOf(#x,'md5')`)
/// apart from a rewritten node reference, without the grammar needing a
/// dedicated `#`-token.
pub const REF_SENTINEL: &str = "\u{0}ref:";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    UInt(u64),
    Float(f64),
    /// String literal. May carry [`REF_SENTINEL`] if it originated from a
    /// `#id` reference.
    Str(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// If this expression is a (possibly sentinel-tagged) reference literal,
    /// returns the bare node path.
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => s.strip_prefix(REF_SENTINEL),
            _ => None,
        }
    }

    /// Walks the AST collecting every node reference it contains (used by
    /// the dependency builder).
    pub fn collect_references(&self, out: &mut Vec<String>) {
        if let Some(r) = self.as_reference() {
            out.push(r.to_string());
            return;
        }
        match self {
            Expr::Unary(_, e) => e.collect_references(out),
            Expr::Binary(_, a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Expr::Ternary(c, t, e) => {
                c.collect_references(out);
                t.collect_references(out);
                e.collect_references(out);
            }
            Expr::Call(_, args) => {
                for a in args {
                    a.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Collects the two-endpoint reference pairs passed to range-shaped
    /// builtins (`…Between(#a,#b)`, `sliceByNodes`), used by the dependency
    /// builder to expand range dependencies.
    pub fn collect_range_calls(&self, out: &mut Vec<(String, String, String)>) {
        if let Expr::Call(name, args) = self {
            if args.len() == 2 {
                if let (Some(a), Some(b)) = (args[0].as_reference(), args[1].as_reference()) {
                    out.push((name.clone(), a.to_string(), b.to_string()));
                }
            }
            for a in args {
                a.collect_range_calls(out);
            }
            return;
        }
        match self {
            Expr::Unary(_, e) => e.collect_range_calls(out),
            Expr::Binary(_, a, b) => {
                a.collect_range_calls(out);
                b.collect_range_calls(out);
            }
            Expr::Ternary(c, t, e) => {
                c.collect_range_calls(out);
                t.collect_range_calls(out);
                e.collect_range_calls(out);
            }
            _ => {}
        }
    }

    /// Collects `size(#g)` group-size calls.
    pub fn collect_group_size_calls(&self, out: &mut Vec<String>) {
        if let Expr::Call(name, args) = self {
            if name == "size" && args.len() == 1 {
                if let Some(g) = args[0].as_reference() {
                    out.push(g.to_string());
                }
            }
            for a in args {
                a.collect_group_size_calls(out);
            }
            return;
        }
        match self {
            Expr::Unary(_, e) => e.collect_group_size_calls(out),
            Expr::Binary(_, a, b) => {
                a.collect_group_size_calls(out);
                b.collect_group_size_calls(out);
            }
            Expr::Ternary(c, t, e) => {
                c.collect_group_size_calls(out);
                t.collect_group_size_calls(out);
                e.collect_group_size_calls(out);
            }
            _ => {}
        }
    }
}
