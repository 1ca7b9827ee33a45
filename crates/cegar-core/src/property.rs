//! Robustness properties: an input box and a linear violation predicate.
//!
//! The violation predicate is kept as a small AST in disjunctive normal form
//! over affine combinations of input (`x<i>`) and output (`y<j>`) variables.
//! Text predicates are parsed by a restricted grammar:
//!
//! ```text
//! predicate  := conjunction ( "||" conjunction )*
//! conjunction:= constraint ( ("&&" | newline) constraint )*
//! constraint := sum cmp sum
//! sum        := ["+"|"-"] term ( ("+"|"-") term )*
//! term       := number ["*"] var | var | number
//! var        := "x" digits | "y" digits
//! cmp        := "<=" | ">=" | "<" | ">"
//! ```
//!
//! Nothing else is accepted, so evaluating a predicate never executes
//! arbitrary code.

use crate::{Bound, CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A variable referenced by a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarRef {
    Input(usize),
    Output(usize),
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarRef::Input(i) => write!(f, "x{i}"),
            VarRef::Output(j) => write!(f, "y{j}"),
        }
    }
}

/// `coeff * var`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub coeff: f64,
    pub var: VarRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Le,
    Ge,
    Lt,
    Gt,
}

impl Comparison {
    #[inline]
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Le => lhs <= rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Gt => lhs > rhs,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Le => "<=",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Gt => ">",
        }
    }
}

/// `Σ terms cmp rhs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraint {
    pub terms: Vec<Term>,
    pub cmp: Comparison,
    pub rhs: f64,
}

impl LinearConstraint {
    pub fn new(terms: Vec<Term>, cmp: Comparison, rhs: f64) -> Self {
        Self { terms, cmp, rhs }
    }

    /// Value of the left-hand side, or `None` if a variable is out of range.
    pub fn lhs_value(&self, inputs: &[f64], outputs: &[f64]) -> Option<f64> {
        let mut acc = 0.0;
        for term in &self.terms {
            let v = match term.var {
                VarRef::Input(i) => *inputs.get(i)?,
                VarRef::Output(j) => *outputs.get(j)?,
            };
            acc += term.coeff * v;
        }
        Some(acc)
    }

    /// Evaluate on a concrete assignment. Out-of-range variables make the
    /// constraint false.
    pub fn holds(&self, inputs: &[f64], outputs: &[f64]) -> bool {
        self.lhs_value(inputs, outputs)
            .is_some_and(|lhs| self.cmp.holds(lhs, self.rhs))
    }

    fn vars(&self) -> impl Iterator<Item = VarRef> + '_ {
        self.terms.iter().map(|t| t.var)
    }
}

impl fmt::Display for LinearConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            write!(f, "0")?;
        }
        for (idx, term) in self.terms.iter().enumerate() {
            let (sign, mag) = if term.coeff < 0.0 {
                ("-", -term.coeff)
            } else {
                ("+", term.coeff)
            };
            if idx == 0 {
                if sign == "-" {
                    write!(f, "-")?;
                }
            } else {
                write!(f, " {sign} ")?;
            }
            if mag == 1.0 {
                write!(f, "{}", term.var)?;
            } else {
                write!(f, "{}*{}", mag, term.var)?;
            }
        }
        write!(f, " {} {}", self.cmp.symbol(), self.rhs)
    }
}

/// Conjunction of linear constraints.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Conjunction(pub Vec<LinearConstraint>);

impl Conjunction {
    pub fn holds(&self, inputs: &[f64], outputs: &[f64]) -> bool {
        self.0.iter().all(|c| c.holds(inputs, outputs))
    }
}

/// A violation predicate in disjunctive normal form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputPredicate {
    pub disjuncts: Vec<Conjunction>,
}

impl OutputPredicate {
    /// Whether the predicate (a property violation) holds on the assignment.
    pub fn holds(&self, inputs: &[f64], outputs: &[f64]) -> bool {
        self.disjuncts.iter().any(|d| d.holds(inputs, outputs))
    }

    /// Every variable mentioned by the predicate.
    pub fn vars(&self) -> impl Iterator<Item = VarRef> + '_ {
        self.disjuncts
            .iter()
            .flat_map(|d| d.0.iter())
            .flat_map(LinearConstraint::vars)
    }

    /// Check that every variable index is within the network's dimensions.
    pub fn check_arity(&self, num_inputs: usize, num_outputs: usize) -> Result<()> {
        for var in self.vars() {
            let ok = match var {
                VarRef::Input(i) => i < num_inputs,
                VarRef::Output(j) => j < num_outputs,
            };
            if !ok {
                return Err(CoreError::InvalidProperty(format!(
                    "predicate references {var} but network has {num_inputs} inputs \
                     and {num_outputs} outputs"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for OutputPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, conj) in self.disjuncts.iter().enumerate() {
            if i > 0 {
                write!(f, " || ")?;
            }
            for (j, c) in conj.0.iter().enumerate() {
                if j > 0 {
                    write!(f, " && ")?;
                }
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for OutputPredicate {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Parser::new(s).parse_predicate()
    }
}

/// A robustness property: every input in `input_bounds` must avoid `violation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub input_bounds: Vec<Bound>,
    pub violation: OutputPredicate,
}

impl Property {
    pub fn new(input_bounds: Vec<Bound>, violation: OutputPredicate) -> Self {
        Self {
            input_bounds,
            violation,
        }
    }

    /// L∞ ball of radius `epsilon` around `sample`, optionally clipped to a domain.
    pub fn linf_ball(sample: &[f64], epsilon: f64, clip: Option<Bound>) -> Result<Vec<Bound>> {
        if !(epsilon >= 0.0) {
            return Err(CoreError::InvalidProperty(format!(
                "perturbation radius must be non-negative, got {epsilon}"
            )));
        }
        sample
            .iter()
            .map(|&v| {
                let ball = Bound::new(v - epsilon, v + epsilon);
                match clip {
                    Some(domain) => ball.intersect(&domain).ok_or_else(|| {
                        CoreError::InvalidProperty(format!(
                            "sample value {v} lies outside the input domain"
                        ))
                    }),
                    None => Ok(ball),
                }
            })
            .collect()
    }

    /// Standard local-robustness property for a classifier: some class other
    /// than `label` scores at least as high as `label` somewhere in the ball.
    pub fn robustness(
        sample: &[f64],
        epsilon: f64,
        label: usize,
        num_outputs: usize,
        clip: Option<Bound>,
    ) -> Result<Self> {
        Ok(Self {
            input_bounds: Self::linf_ball(sample, epsilon, clip)?,
            violation: Self::robustness_predicate(label, num_outputs)?,
        })
    }

    /// `∃ j ≠ label: y_j - y_label >= 0`.
    pub fn robustness_predicate(label: usize, num_outputs: usize) -> Result<OutputPredicate> {
        if label >= num_outputs {
            return Err(CoreError::InvalidProperty(format!(
                "label {label} out of range for {num_outputs} outputs"
            )));
        }
        let disjuncts = (0..num_outputs)
            .filter(|&j| j != label)
            .map(|j| {
                Conjunction(vec![LinearConstraint::new(
                    vec![
                        Term {
                            coeff: 1.0,
                            var: VarRef::Output(j),
                        },
                        Term {
                            coeff: -1.0,
                            var: VarRef::Output(label),
                        },
                    ],
                    Comparison::Ge,
                    0.0,
                )])
            })
            .collect();
        Ok(OutputPredicate { disjuncts })
    }

    /// Check the property against network dimensions.
    pub fn validate(&self, num_inputs: usize, num_outputs: usize) -> Result<()> {
        if self.input_bounds.len() != num_inputs {
            return Err(CoreError::InvalidProperty(format!(
                "property bounds {} inputs but network has {}",
                self.input_bounds.len(),
                num_inputs
            )));
        }
        if let Some(b) = self
            .input_bounds
            .iter()
            .find(|b| !(b.lower <= b.upper) || b.lower.is_nan())
        {
            return Err(CoreError::InvalidProperty(format!(
                "empty input interval [{}, {}]",
                b.lower, b.upper
            )));
        }
        self.violation.check_arity(num_inputs, num_outputs)
    }

    /// Whether an input lies inside the box (with tolerance).
    pub fn contains_input(&self, input: &[f64], tolerance: f64) -> bool {
        input.len() == self.input_bounds.len()
            && input
                .iter()
                .zip(&self.input_bounds)
                .all(|(&v, b)| b.contains_with_tolerance(v, tolerance))
    }

    /// Load a property from a JSON file.
    pub fn load(path: &Path, num_outputs: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::Load {
            what: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file: PropertyFile = serde_json::from_str(&text).map_err(|e| CoreError::Load {
            what: "property".to_string(),
            message: e.to_string(),
        })?;
        file.into_property(num_outputs)
    }
}

/// On-disk property description.
///
/// Either `input_bounds` or `sample` + `epsilon` must be given, and either a
/// `violation` predicate or a `label` for the standard robustness predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyFile {
    #[serde(default)]
    pub input_bounds: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    pub sample: Option<Vec<f64>>,
    #[serde(default)]
    pub epsilon: Option<f64>,
    #[serde(default)]
    pub clip: Option<[f64; 2]>,
    #[serde(default)]
    pub violation: Option<String>,
    #[serde(default)]
    pub label: Option<usize>,
}

impl PropertyFile {
    pub fn into_property(self, num_outputs: usize) -> Result<Property> {
        let clip = self.clip.map(|[lo, hi]| Bound { lower: lo, upper: hi });
        let input_bounds = match (&self.input_bounds, &self.sample, self.epsilon) {
            (Some(bounds), _, _) => bounds
                .iter()
                .map(|&[lo, hi]| Bound { lower: lo, upper: hi })
                .collect(),
            (None, Some(sample), Some(eps)) => Property::linf_ball(sample, eps, clip)?,
            _ => {
                return Err(CoreError::InvalidProperty(
                    "property needs input_bounds or sample + epsilon".to_string(),
                ))
            }
        };
        let violation = match (&self.violation, self.label) {
            (Some(text), _) => text.parse()?,
            (None, Some(label)) => Property::robustness_predicate(label, num_outputs)?,
            (None, None) => {
                return Err(CoreError::InvalidProperty(
                    "property needs a violation predicate or a label".to_string(),
                ))
            }
        };
        Ok(Property {
            input_bounds,
            violation,
        })
    }
}

// =============================================================================
// Predicate parser
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Var(VarRef),
    Plus,
    Minus,
    Star,
    Cmp(Comparison),
    And,
    Or,
    Newline,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    error: Option<CoreError>,
}

impl Parser {
    fn new(input: &str) -> Self {
        match tokenize(input) {
            Ok(tokens) => Self {
                tokens,
                pos: 0,
                error: None,
            },
            Err(e) => Self {
                tokens: Vec::new(),
                pos: 0,
                error: Some(e),
            },
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn column(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |(c, _)| *c)
    }

    fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(CoreError::Parse {
            column: self.column(),
            message: message.into(),
        })
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Some(&Token::Newline) {
            self.pos += 1;
        }
    }

    fn parse_predicate(mut self) -> Result<OutputPredicate> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let mut disjuncts = vec![self.parse_conjunction()?];
        loop {
            self.skip_newlines();
            match self.peek() {
                Some(Token::Or) => {
                    self.pos += 1;
                    disjuncts.push(self.parse_conjunction()?);
                }
                None => break,
                Some(_) => return self.fail("expected '||' or end of input"),
            }
        }
        Ok(OutputPredicate { disjuncts })
    }

    fn parse_conjunction(&mut self) -> Result<Conjunction> {
        self.skip_newlines();
        let mut constraints = vec![self.parse_constraint()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    self.skip_newlines();
                    constraints.push(self.parse_constraint()?);
                }
                Some(Token::Newline) => {
                    self.skip_newlines();
                    match self.peek() {
                        None | Some(Token::Or) => break,
                        _ => constraints.push(self.parse_constraint()?),
                    }
                }
                _ => break,
            }
        }
        Ok(Conjunction(constraints))
    }

    fn parse_constraint(&mut self) -> Result<LinearConstraint> {
        let (lhs_terms, lhs_const) = self.parse_sum()?;
        let cmp = match self.peek() {
            Some(Token::Cmp(c)) => *c,
            _ => return self.fail("expected comparison operator"),
        };
        self.pos += 1;
        let (rhs_terms, rhs_const) = self.parse_sum()?;

        // Move variables left and constants right, merging repeated variables.
        let mut terms: Vec<Term> = Vec::new();
        let moved = rhs_terms.into_iter().map(|t| Term {
            coeff: -t.coeff,
            var: t.var,
        });
        for term in lhs_terms.into_iter().chain(moved) {
            match terms.iter_mut().find(|t| t.var == term.var) {
                Some(existing) => existing.coeff += term.coeff,
                None => terms.push(term),
            }
        }
        terms.retain(|t| t.coeff != 0.0);
        Ok(LinearConstraint::new(terms, cmp, rhs_const - lhs_const))
    }

    fn parse_sum(&mut self) -> Result<(Vec<Term>, f64)> {
        let mut terms = Vec::new();
        let mut constant = 0.0;
        let mut sign = 1.0;
        let mut first = true;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                }
                Some(Token::Minus) => {
                    sign = -sign;
                    self.pos += 1;
                }
                _ if !first => break,
                _ => {}
            }
            match self.peek().cloned() {
                Some(Token::Num(n)) => {
                    self.pos += 1;
                    if self.peek() == Some(&Token::Star) {
                        self.pos += 1;
                    }
                    match self.peek().cloned() {
                        Some(Token::Var(var)) => {
                            self.pos += 1;
                            terms.push(Term {
                                coeff: sign * n,
                                var,
                            });
                        }
                        _ => constant += sign * n,
                    }
                }
                Some(Token::Var(var)) => {
                    self.pos += 1;
                    terms.push(Term { coeff: sign, var });
                }
                _ => return self.fail("expected number or variable"),
            }
            sign = 1.0;
            first = false;
            if !matches!(self.peek(), Some(Token::Plus | Token::Minus)) {
                break;
            }
        }
        Ok((terms, constant))
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |column: usize, message: String| CoreError::Parse { column, message };

    while i < chars.len() {
        let c = chars[i];
        let col = i;
        match c {
            '\n' | ';' => {
                tokens.push((col, Token::Newline));
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push((col, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((col, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((col, Token::Star));
                i += 1;
            }
            '<' | '>' => {
                let strict = chars.get(i + 1) != Some(&'=');
                let cmp = match (c, strict) {
                    ('<', true) => Comparison::Lt,
                    ('<', false) => Comparison::Le,
                    (_, true) => Comparison::Gt,
                    (_, false) => Comparison::Ge,
                };
                tokens.push((col, Token::Cmp(cmp)));
                i += if strict { 1 } else { 2 };
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push((col, Token::And));
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push((col, Token::Or));
                i += 2;
            }
            'x' | 'y' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                if end == start {
                    return Err(err(col, format!("variable '{c}' needs an index")));
                }
                let idx: usize = chars[start..end]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .map_err(|_| err(col, "variable index too large".to_string()))?;
                let var = if c == 'x' {
                    VarRef::Input(idx)
                } else {
                    VarRef::Output(idx)
                };
                tokens.push((col, Token::Var(var)));
                i = end;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                // Exponent: 1e-3, 2.5E+4
                if end < chars.len() && matches!(chars[end], 'e' | 'E') {
                    let mut exp_end = end + 1;
                    if exp_end < chars.len() && matches!(chars[exp_end], '+' | '-') {
                        exp_end += 1;
                    }
                    if exp_end < chars.len() && chars[exp_end].is_ascii_digit() {
                        while exp_end < chars.len() && chars[exp_end].is_ascii_digit() {
                            exp_end += 1;
                        }
                        end = exp_end;
                    }
                }
                let text: String = chars[i..end].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| err(col, format!("invalid number '{text}'")))?;
                tokens.push((col, Token::Num(n)));
                i = end;
            }
            other => return Err(err(col, format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}
