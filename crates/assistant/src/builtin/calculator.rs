use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{single_string_schema, string_arg, BuiltinTool};
use crate::errors::{ToolError, ToolResult};

const ALLOWED_EXPRESSION: &str = r"^[\d\s\+\-\*/\(\)\.\^%]+$";

pub struct Calculator;

#[async_trait]
impl BuiltinTool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Perform mathematical calculations"
    }

    fn default_context(&self) -> &str {
        "You are performing mathematical calculations. Calculate the expression accurately and show your work."
    }

    fn input_schema(&self) -> Value {
        single_string_schema(
            "expression",
            "A mathematical expression using + - * / % ^ and parentheses",
        )
    }

    async fn call(&self, arguments: Value) -> ToolResult<String> {
        let expression = string_arg(&arguments, "expression")?.trim();
        let allowed =
            Regex::new(ALLOWED_EXPRESSION).map_err(|e| ToolError::ExecutionError(e.to_string()))?;
        if !allowed.is_match(expression) {
            return Err(ToolError::InvalidParameters(
                "Invalid expression. Only basic mathematical operations are allowed.".to_string(),
            ));
        }

        let value = evaluate(expression)?;
        Ok(format!("The result of {} is {}", expression, format_number(value)))
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Evaluate an arithmetic expression. `^` is exponentiation and binds tighter than
/// unary minus; `%` follows the sign of the divisor.
pub fn evaluate(expression: &str) -> ToolResult<f64> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax_error());
    }
    if !value.is_finite() {
        return Err(ToolError::ExecutionError("result is not a finite number".into()));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(char),
    Open,
    Close,
}

fn syntax_error() -> ToolError {
    ToolError::InvalidParameters("Error calculating expression: invalid syntax".into())
}

fn tokenize(expression: &str) -> ToolResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal.parse::<f64>().map_err(|_| syntax_error())?;
                tokens.push(Token::Number(number));
            }
            '+' | '-' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '*' => {
                // `**` is accepted as an alias for `^`
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Op('^'));
                    i += 2;
                } else {
                    tokens.push(Token::Op('*'));
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            _ => return Err(syntax_error()),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> ToolResult<f64> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> ToolResult<f64> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                _ if rhs == 0.0 => {
                    return Err(ToolError::ExecutionError(
                        "Error calculating expression: division by zero".into(),
                    ))
                }
                '/' => value / rhs,
                _ => value - rhs * (value / rhs).floor(),
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> ToolResult<f64> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> ToolResult<f64> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> ToolResult<f64> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err(syntax_error()),
                }
            }
            _ => Err(syntax_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(evaluate("2+2").unwrap(), 4.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2^3^2").unwrap(), 512.0);
        assert_eq!(evaluate("-2^2").unwrap(), -4.0);
        assert_eq!(evaluate("7 % 3").unwrap(), 1.0);
        assert_eq!(evaluate("-7 % 3").unwrap(), 2.0);
        assert_eq!(evaluate("7 / 2").unwrap(), 3.5);
    }

    #[test]
    fn test_bad_expressions() {
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 2").is_err());
        assert!(evaluate("1..2").is_err());
    }

    #[tokio::test]
    async fn test_call_formats_result() {
        let result = Calculator
            .call(json!({"expression": "15 * 4 + 2^3"}))
            .await
            .unwrap();
        assert_eq!(result, "The result of 15 * 4 + 2^3 is 68");

        let result = Calculator.call(json!({"expression": "1/4"})).await.unwrap();
        assert_eq!(result, "The result of 1/4 is 0.25");
    }

    #[tokio::test]
    async fn test_call_rejects_names_and_functions() {
        let err = Calculator
            .call(json!({"expression": "__import__('os')"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let err = Calculator.call(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
