//! Arithmetic evaluation tool

use super::{Tool, ToolContext, ToolOutput, ToolServerError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Longest expression accepted, in characters
const MAX_EXPRESSION_LEN: usize = 4096;
/// Deepest nesting of parentheses, unary minus and exponents
const MAX_DEPTH: usize = 256;

pub struct CalculatorTool;

#[derive(Debug, Deserialize)]
struct EvaluateInput {
    expression: String,
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &'static str {
        "evaluate"
    }

    fn description(&self) -> String {
        "Evaluate an arithmetic expression exactly. Supports + - * / % ^, parentheses, unary minus and decimals. Use this instead of doing arithmetic in your head.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["expression"],
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. (2 + 3) * 4"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolServerError> {
        let input: EvaluateInput = serde_json::from_value(input)
            .map_err(|e| ToolServerError::InvalidInput(e.to_string()))?;
        let value = evaluate(&input.expression).map_err(ToolServerError::Failed)?;
        Ok(ToolOutput::text(format_number(value)))
    }
}

/// Evaluate an arithmetic expression
pub fn evaluate(expression: &str) -> Result<f64, String> {
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(format!(
            "Expression is longer than {MAX_EXPRESSION_LEN} characters"
        ));
    }
    let mut parser = Parser {
        chars: expression.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
        depth: 0,
    };
    if parser.chars.is_empty() {
        return Err("Empty expression".to_string());
    }
    let value = parser.expr()?;
    if let Some(c) = parser.peek() {
        return Err(format!("Unexpected '{c}' at position {}", parser.pos + 1));
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err("Result is not a finite number".to_string())
    }
}

/// Whole numbers print without a fractional part
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        let formatted = format!("{value:.10}");
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

// Grammar:
//   expr   := term (('+' | '-') term)*
//   term   := unary (('*' | '/' | '%') unary)*
//   unary  := '-' unary | power
//   power  := atom ('^' unary)?
//   atom   := number | '(' expr ')'
struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        loop {
            if self.eat('+') {
                value += self.term()?;
            } else if self.eat('-') {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        loop {
            if self.eat('*') {
                value *= self.unary()?;
            } else if self.eat('/') {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err("Division by zero".to_string());
                }
                value /= divisor;
            } else if self.eat('%') {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err("Division by zero".to_string());
                }
                value %= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    // Every recursive production passes through here
    fn unary(&mut self) -> Result<f64, String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("Expression nested too deeply".to_string());
        }
        let value = if self.eat('-') {
            self.unary().map(|v| -v)
        } else {
            self.power()
        };
        self.depth -= 1;
        value
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.atom()?;
        if self.eat('^') {
            // right-associative
            let exponent = self.unary()?;
            Ok(base.powf(exponent))
        } else {
            Ok(base)
        }
    }

    fn atom(&mut self) -> Result<f64, String> {
        if self.eat('(') {
            let value = self.expr()?;
            if !self.eat(')') {
                return Err("Missing closing parenthesis".to_string());
            }
            return Ok(value);
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return match self.peek() {
                Some(c) => Err(format!("Unexpected '{c}' at position {}", self.pos + 1)),
                None => Err("Unexpected end of expression".to_string()),
            };
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse()
            .map_err(|_| format!("Invalid number '{literal}'"))
    }
}
