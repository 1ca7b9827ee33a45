//! Read variable values out of an SMT-LIB `(get-model)` response.
//!
//! Solvers print models as a list of `define-fun` forms whose bodies are
//! real constants, possibly written as `(- 3.0)`, `(/ 7 2)` or nested
//! combinations of those:
//!
//! ```text
//! (model
//!   (define-fun x_0 () Real 0.5)
//!   (define-fun y_1 () Real (- (/ 1 4)))
//! )
//! ```
//!
//! Z3 omits the `model` keyword and prints a bare list; both forms are accepted.

use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut atom = String::new();
    let mut in_string = false;
    for ch in text.chars() {
        if in_string {
            atom.push(ch);
            if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '(' | ')' => {
                if !atom.is_empty() {
                    tokens.push(std::mem::take(&mut atom));
                }
                tokens.push(ch.to_string());
            }
            c if c.is_whitespace() => {
                if !atom.is_empty() {
                    tokens.push(std::mem::take(&mut atom));
                }
            }
            '"' => {
                in_string = true;
                atom.push(ch);
            }
            _ => atom.push(ch),
        }
    }
    if !atom.is_empty() {
        tokens.push(atom);
    }
    tokens
}

fn parse_sexp(tokens: &[String], pos: &mut usize) -> Option<Sexp> {
    let token = tokens.get(*pos)?;
    *pos += 1;
    match token.as_str() {
        "(" => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos)?.as_str() {
                    ")" => {
                        *pos += 1;
                        return Some(Sexp::List(items));
                    }
                    _ => items.push(parse_sexp(tokens, pos)?),
                }
            }
        }
        ")" => None,
        atom => Some(Sexp::Atom(atom.to_string())),
    }
}

fn number(atom: &str) -> Option<f64> {
    let digits = atom.strip_prefix('+').unwrap_or(atom);
    let first = digits.trim_start_matches('-').chars().next()?;
    if !(first.is_ascii_digit() || first == '.') {
        return None;
    }
    digits.parse().ok()
}

/// Evaluate a constant real term.
fn eval(term: &Sexp) -> Option<f64> {
    match term {
        Sexp::Atom(atom) => number(atom),
        Sexp::List(items) => {
            let (op, args) = items.split_first()?;
            let Sexp::Atom(op) = op else { return None };
            let values = args.iter().map(eval).collect::<Option<Vec<f64>>>()?;
            match (op.as_str(), values.as_slice()) {
                ("-", [a]) => Some(-a),
                ("-", [a, rest @ ..]) => Some(rest.iter().fold(*a, |acc, v| acc - v)),
                ("/", [a, b]) => Some(a / b),
                ("+", vals) if !vals.is_empty() => Some(vals.iter().sum()),
                ("*", vals) if !vals.is_empty() => Some(vals.iter().product()),
                _ => None,
            }
        }
    }
}

/// `(define-fun name () Sort value)` into `(name, value)`.
fn definition(item: &Sexp) -> Option<(String, f64)> {
    let Sexp::List(parts) = item else { return None };
    match parts.as_slice() {
        [Sexp::Atom(kw), Sexp::Atom(name), Sexp::List(params), _sort, value]
            if kw == "define-fun" && params.is_empty() =>
        {
            Some((name.clone(), eval(value)?))
        }
        _ => None,
    }
}

/// Parse a model into a map from variable name to value.
///
/// Returns `None` for solver errors and malformed output. Definitions whose
/// value is not a real constant are skipped.
pub fn parse_model_to_map(model: &str) -> Option<HashMap<String, f64>> {
    let trimmed = model.trim_start();
    if trimmed.starts_with("(error") {
        debug!(model = trimmed, "Solver returned an error instead of a model");
        return None;
    }
    let tokens = tokenize(model);
    let mut pos = 0;
    let Sexp::List(items) = parse_sexp(&tokens, &mut pos)? else {
        return None;
    };
    let body = match items.first() {
        Some(Sexp::Atom(kw)) if kw == "model" => &items[1..],
        _ => &items[..],
    };
    Some(body.iter().filter_map(definition).collect())
}

/// Values of `names`, in order. `None` if any of them is missing.
pub fn parse_model(model: &str, names: &[String]) -> Option<Vec<f64>> {
    let values = parse_model_to_map(model)?;
    names.iter().map(|n| values.get(n).copied()).collect()
}
