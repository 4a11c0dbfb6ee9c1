//! A small XPath 1.0 subset, used to select elements of a [`Document`].
//!
//! Supported: absolute (`/a/b`), descendant (`//a`) and relative paths,
//! name tests (`name`, `prefix:name`, `*`), `.` and `..`, and predicates over
//! attributes (`@a`, `@a='v'`, `@a!='v'`) combined with `and`, `or`, `not()`
//! and parentheses. A predicate that is a lone number (`[2]`) selects by position.
use crate::document::Document;
use crate::element::Element;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A compiled query.
///
/// ```
/// use xml_attr_filter::{Document, Query};
/// use std::str::FromStr;
///
/// let doc = Document::from_str(r#"<r><i on="true"/><i on="false"/></r>"#).unwrap();
/// let query = Query::compile("//i[@on='true']").unwrap();
/// assert_eq!(query.select(&doc).len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    text: String,
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    Any,
    Name(String),
}

impl NodeTest {
    fn matches(&self, document: &Document, element: Element) -> bool {
        match self {
            NodeTest::Any => true,
            NodeTest::Name(name) => element.full_name(document) == name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    HasAttr(String),
    AttrEq(String, String),
    AttrNe(String, String),
}

impl Expr {
    fn eval(&self, document: &Document, element: Element) -> bool {
        match self {
            Expr::Or(lhs, rhs) => lhs.eval(document, element) || rhs.eval(document, element),
            Expr::And(lhs, rhs) => lhs.eval(document, element) && rhs.eval(document, element),
            Expr::Not(inner) => !inner.eval(document, element),
            Expr::HasAttr(name) => element.attribute(document, name).is_some(),
            Expr::AttrEq(name, value) => {
                element.attribute(document, name) == Some(value.as_str())
            }
            // An absent attribute is not unequal to anything.
            Expr::AttrNe(name, value) => matches!(
                element.attribute(document, name),
                Some(actual) if actual != value.as_str()
            ),
        }
    }
}

impl Step {
    fn candidates(&self, document: &Document, context: Element) -> Vec<Element> {
        let elements = match self.axis {
            Axis::Child => context.child_elements(document),
            Axis::Descendant => context.child_elements_recursive(document),
            Axis::SelfNode => vec![context],
            Axis::Parent => context.parent(document).into_iter().collect(),
        };
        elements
            .into_iter()
            .filter(|elem| match elem.is_container() {
                true => self.test == NodeTest::Any,
                false => self.test.matches(document, *elem),
            })
            .collect()
    }

    fn select(&self, document: &Document, context: Element) -> Vec<Element> {
        let mut selected = self.candidates(document, context);
        for predicate in &self.predicates {
            selected = match predicate {
                Predicate::Position(pos) => selected
                    .get(pos.wrapping_sub(1))
                    .copied()
                    .into_iter()
                    .collect(),
                Predicate::Expr(expr) => selected
                    .into_iter()
                    .filter(|elem| expr.eval(document, *elem))
                    .collect(),
            };
        }
        selected
    }
}

impl Query {
    /// Compile query text.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidQuery`]: The text is not a supported expression.
    pub fn compile(text: &str) -> Result<Query> {
        let tokens = tokenize(text)?;
        let mut parser = QueryParser {
            text,
            tokens,
            pos: 0,
        };
        let query = parser.parse_path()?;
        tracing::trace!(query = text, steps = query.steps.len(), "compiled query");
        Ok(query)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the query starts at the document container (`/...`, `//...`).
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Evaluate the query against the document and return the matching
    /// elements in document order, without duplicates.
    ///
    /// Relative queries are evaluated from the document container too,
    /// so `item` selects a root element named `item`.
    pub fn select(&self, document: &Document) -> Vec<Element> {
        let mut context = vec![document.container()];
        let mut order: Option<HashMap<Element, usize>> = None;
        for step in &self.steps {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for elem in &context {
                for found in step.select(document, *elem) {
                    if seen.insert(found) {
                        next.push(found);
                    }
                }
            }
            if context.len() > 1 && next.len() > 1 {
                let order = order.get_or_insert_with(|| document_order(document));
                next.sort_by_key(|elem| order.get(elem).copied().unwrap_or(0));
            }
            context = next;
        }
        context.retain(|elem| !elem.is_container());
        context
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn document_order(document: &Document) -> HashMap<Element, usize> {
    let container = document.container();
    let mut order = HashMap::new();
    order.insert(container, 0);
    for (i, elem) in container
        .child_elements_recursive(document)
        .into_iter()
        .enumerate()
    {
        order.insert(elem, i + 1);
    }
    order
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DoubleDot,
    Star,
    At,
    Eq,
    Ne,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Name(String),
    Literal(String),
    Number(usize),
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':'
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '/' => {
                if chars.next_if(|(_, c)| *c == '/').is_some() {
                    Token::DoubleSlash
                } else {
                    Token::Slash
                }
            }
            '.' => {
                if chars.next_if(|(_, c)| *c == '.').is_some() {
                    Token::DoubleDot
                } else {
                    Token::Dot
                }
            }
            '*' => Token::Star,
            '@' => Token::At,
            '=' => Token::Eq,
            '!' => {
                if chars.next_if(|(_, c)| *c == '=').is_some() {
                    Token::Ne
                } else {
                    return Err(Error::InvalidQuery(format!(
                        "expected '!=' at offset {} in {:?}",
                        i, text
                    )));
                }
            }
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '\'' | '"' => {
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, ch)) => literal.push(ch),
                        None => {
                            return Err(Error::InvalidQuery(format!(
                                "unterminated literal at offset {} in {:?}",
                                i, text
                            )))
                        }
                    }
                }
                Token::Literal(literal)
            }
            c if c.is_ascii_digit() => {
                let mut digits = c.to_string();
                while let Some((_, d)) = chars.next_if(|(_, d)| d.is_ascii_digit()) {
                    digits.push(d);
                }
                let number = digits.parse().map_err(|_| {
                    Error::InvalidQuery(format!("number too large in {:?}", text))
                })?;
                Token::Number(number)
            }
            c if is_name_start(c) => {
                let mut name = c.to_string();
                while let Some((_, n)) = chars.next_if(|(_, n)| is_name_char(*n)) {
                    name.push(n);
                }
                if name.ends_with(':') || name.matches(':').count() > 1 {
                    return Err(Error::InvalidQuery(format!(
                        "invalid qualified name {:?} in {:?}",
                        name, text
                    )));
                }
                Token::Name(name)
            }
            c => {
                return Err(Error::InvalidQuery(format!(
                    "unexpected character {:?} at offset {} in {:?}",
                    c, i, text
                )))
            }
        };
        tokens.push(token);
    }
    Ok(tokens)
}

struct QueryParser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> QueryParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, msg: &str) -> Error {
        match self.tokens.get(self.pos) {
            Some(token) => Error::InvalidQuery(format!(
                "{}, found {:?} in {:?}",
                msg, token, self.text
            )),
            None => Error::InvalidQuery(format!("{}, found end of query in {:?}", msg, self.text)),
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", token)))
        }
    }

    fn parse_path(&mut self) -> Result<Query> {
        if self.tokens.is_empty() {
            return Err(Error::InvalidQuery("empty query".to_string()));
        }
        let mut steps = Vec::new();
        let absolute = matches!(self.peek(), Some(Token::Slash) | Some(Token::DoubleSlash));
        if !absolute {
            steps.push(self.parse_step(Axis::Child)?);
        }
        while let Some(token) = self.peek() {
            let axis = match token {
                Token::Slash => Axis::Child,
                Token::DoubleSlash => Axis::Descendant,
                _ => return Err(self.error("expected '/' or '//'")),
            };
            self.pos += 1;
            if axis == Axis::Child && self.peek().is_none() && steps.is_empty() {
                // a lone "/" selects the container, which is never returned
                break;
            }
            steps.push(self.parse_step(axis)?);
        }
        Ok(Query {
            text: self.text.to_string(),
            absolute,
            steps,
        })
    }

    fn parse_step(&mut self, axis: Axis) -> Result<Step> {
        let (axis, test) = match self.next() {
            Some(Token::Dot) => (Axis::SelfNode, NodeTest::Any),
            Some(Token::DoubleDot) => (Axis::Parent, NodeTest::Any),
            Some(Token::Star) => (axis, NodeTest::Any),
            Some(Token::Name(name)) => (axis, NodeTest::Name(name)),
            _ => {
                self.pos -= 1;
                return Err(self.error("expected a node test"));
            }
        };
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            let predicate = match (self.peek(), self.tokens.get(self.pos + 1)) {
                (Some(Token::Number(n)), Some(Token::RBracket)) => {
                    let n = *n;
                    self.pos += 1;
                    Predicate::Position(n)
                }
                _ => Predicate::Expr(self.parse_or()?),
            };
            self.expect(Token::RBracket)?;
            predicates.push(predicate);
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::Name("or".to_string())) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&Token::Name("and".to_string())) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Name(name)) if name == "not" => {
                self.expect(Token::LParen)?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::At) => {
                let name = match self.next() {
                    Some(Token::Name(name)) => name,
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected an attribute name"));
                    }
                };
                if self.eat(&Token::Eq) {
                    Ok(Expr::AttrEq(name, self.parse_literal()?))
                } else if self.eat(&Token::Ne) {
                    Ok(Expr::AttrNe(name, self.parse_literal()?))
                } else {
                    Ok(Expr::HasAttr(name))
                }
            }
            Some(Token::Number(_)) => {
                self.pos -= 1;
                Err(self.error("positional predicates must stand alone"))
            }
            _ => {
                self.pos -= 1;
                Err(self.error("expected an attribute test"))
            }
        }
    }

    fn parse_literal(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(value),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a quoted literal"))
            }
        }
    }
}
