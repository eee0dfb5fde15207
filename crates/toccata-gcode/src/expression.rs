//! Recursive-descent expression evaluator over the tagged value domain.
//!
//! Operator precedence, lowest to highest: `?:`, `^` (string
//! concatenation), `&`/`|` (short-circuit boolean), comparisons, `+`/`-`,
//! `*`/`/`, then the unary operators. `==`, `&&` and `||` are accepted as
//! aliases for `=`, `&` and `|`.
//!
//! Short-circuit operators still walk their unevaluated operand with
//! `evaluate = false`, so syntax errors are always reported but semantic
//! errors (an unknown object-model path, say) are suppressed.

use thiserror::Error;

use crate::value::{parse_datetime, DriverId, Value, MAX_FLOAT_DIGITS};

/// Recursion budget for the evaluator. Each nested sub-expression consumes
/// one level; running out is reported as a parse error rather than risking
/// the task stack.
pub const MAX_EXPRESSION_DEPTH: usize = 30;

pub const MAX_INDICES: usize = 4;

const MAX_STRING_EXPRESSION_LENGTH: usize = 100;
const MAX_VARIABLE_NAME_LENGTH: usize = 100;

const RADIANS_TO_DEGREES: f64 = 180.0 / std::f64::consts::PI;
const DEGREES_TO_RADIANS: f64 = std::f64::consts::PI / 180.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub column: usize,
    pub message: String,
}

/// Everything the object model needs to answer a lookup: the array indices
/// collected while parsing the path, and whether the caller wants the array
/// length (`#`) or a pure existence test (`exists(...)`).
#[derive(Debug, Clone)]
pub struct LookupContext {
    indices: [i32; MAX_INDICES],
    num_indices: usize,
    want_length: bool,
    want_exists: bool,
    pub line: u32,
    pub column: usize,
}

impl LookupContext {
    fn new(want_length: bool, want_exists: bool, line: u32, column: usize) -> Self {
        Self {
            indices: [0; MAX_INDICES],
            num_indices: 0,
            want_length,
            want_exists,
            line,
            column,
        }
    }

    fn provide_index(&mut self, index: i32) -> Result<(), ()> {
        if self.num_indices == MAX_INDICES {
            return Err(());
        }
        self.indices[self.num_indices] = index;
        self.num_indices += 1;
        Ok(())
    }

    pub fn indices(&self) -> &[i32] {
        &self.indices[..self.num_indices]
    }

    pub fn want_length(&self) -> bool {
        self.want_length
    }

    pub fn want_exists(&self) -> bool {
        self.want_exists
    }
}

/// Dotted-path lookup into the machine's object model. Index expressions in
/// the path are replaced by `^` markers; the evaluated indices arrive in the
/// context. Returns `None` when the path does not exist.
pub trait ObjectModel {
    fn lookup(&self, context: &LookupContext, path: &str) -> Option<Value>;
}

/// An object model with no entries, for syntax-only checking.
pub struct NullObjectModel;

impl ObjectModel for NullObjectModel {
    fn lookup(&self, _context: &LookupContext, _path: &str) -> Option<Value> {
        None
    }
}

/// Caller-supplied state behind the named constants `iterations`, `result`
/// and `line`.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub line_number: u32,
    /// Iteration count of the innermost enclosing loop, if any.
    pub iterations: Option<i32>,
    /// Result code of the last command: 0 ok, 1 warning, 2 error.
    pub last_result: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Abs,
    Acos,
    Asin,
    Atan,
    Atan2,
    Cos,
    Datetime,
    Degrees,
    Exists,
    Floor,
    Isnan,
    Max,
    Min,
    Mod,
    Radians,
    Random,
    Sin,
    Sqrt,
    Tan,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Function::Abs,
            "acos" => Function::Acos,
            "asin" => Function::Asin,
            "atan" => Function::Atan,
            "atan2" => Function::Atan2,
            "cos" => Function::Cos,
            "datetime" => Function::Datetime,
            "degrees" => Function::Degrees,
            "exists" => Function::Exists,
            "floor" => Function::Floor,
            "isnan" => Function::Isnan,
            "max" => Function::Max,
            "min" => Function::Min,
            "mod" => Function::Mod,
            "radians" => Function::Radians,
            "random" => Function::Random,
            "sin" => Function::Sin,
            "sqrt" => Function::Sqrt,
            "tan" => Function::Tan,
            _ => return None,
        })
    }
}

pub struct ExpressionParser<'a> {
    input: &'a [u8],
    pos: usize,
    start_column: usize,
    model: &'a dyn ObjectModel,
    context: EvalContext,
    depth: usize,
}

impl<'a> ExpressionParser<'a> {
    pub fn new(text: &'a str, model: &'a dyn ObjectModel, context: EvalContext) -> Self {
        Self::with_column(text, model, context, 1)
    }

    /// As [`ExpressionParser::new`], recording the column at which the
    /// expression starts within its source line so errors point at the
    /// right place.
    pub fn with_column(
        text: &'a str,
        model: &'a dyn ObjectModel,
        context: EvalContext,
        start_column: usize,
    ) -> Self {
        Self {
            input: text.as_bytes(),
            pos: 0,
            start_column,
            model,
            context,
            depth: 0,
        }
    }

    /// Evaluate the expression.
    pub fn parse(&mut self) -> Result<Value, ParseError> {
        self.parse_with(true)
    }

    /// Walk the expression; with `evaluate` false only syntax is checked.
    pub fn parse_with(&mut self, evaluate: bool) -> Result<Value, ParseError> {
        self.parse_internal(evaluate, 0)
    }

    pub fn parse_boolean(&mut self) -> Result<bool, ParseError> {
        let mut val = self.parse()?;
        self.convert_to_bool(&mut val, true)?;
        match val {
            Value::Bool(b) => Ok(b),
            _ => unreachable!("convert_to_bool yields a Boolean"),
        }
    }

    pub fn parse_float(&mut self) -> Result<f64, ParseError> {
        let mut val = self.parse()?;
        self.convert_to_float(&mut val, true)?;
        match val {
            Value::Float(f, _) => Ok(f),
            _ => unreachable!("convert_to_float yields a float"),
        }
    }

    pub fn parse_integer(&mut self) -> Result<i32, ParseError> {
        match self.parse()? {
            Value::Int(i) => Ok(i),
            Value::Uint(u) => {
                if u > i32::MAX as u32 {
                    Err(self.error("unsigned integer too large"))
                } else {
                    Ok(u as i32)
                }
            }
            _ => Err(self.error("expected integer value")),
        }
    }

    pub fn parse_unsigned(&mut self) -> Result<u32, ParseError> {
        match self.parse()? {
            Value::Uint(u) => Ok(u),
            Value::Int(i) if i >= 0 => Ok(i as u32),
            Value::Int(_) => Err(self.error("value must be non-negative")),
            _ => Err(self.error("expected non-negative integer value")),
        }
    }

    pub fn parse_driver_id(&mut self) -> Result<DriverId, ParseError> {
        let mut val = self.parse()?;
        self.convert_to_driver_id(&mut val, true)?;
        match val {
            Value::Driver(id) => Ok(id),
            _ => unreachable!("convert_to_driver_id yields a driver ID"),
        }
    }

    /// Consume the given character if it is next (after whitespace). Used
    /// by callers that parse comma-separated expression lists.
    pub fn try_consume(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        if self.current_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Error unless the whole input was consumed.
    pub fn check_for_extra_characters(&mut self) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.current_char().is_some() {
            return Err(self.error("unexpected characters after expression"));
        }
        Ok(())
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.pos).map(|&b| b as char)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn column(&self) -> usize {
        self.start_column + self.pos
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.context.line_number,
            column: self.column(),
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.current_char(), Some(' ') | Some('\t')) {
            self.advance();
        }
    }

    // Depth-guarded entry point for every recursive descent.
    fn parse_internal(&mut self, evaluate: bool, priority: u8) -> Result<Value, ParseError> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(self.error("expression nesting too deep"));
        }
        self.depth += 1;
        let result = self.parse_internal_inner(evaluate, priority);
        self.depth -= 1;
        result
    }

    // Evaluate an expression, stopping before any binary operator with
    // priority `priority` or lower.
    fn parse_internal_inner(&mut self, evaluate: bool, priority: u8) -> Result<Value, ParseError> {
        const OPERATORS: &[u8] = b"?^&|!=<>+-*/";
        const PRIORITIES: [u8; 12] = [1, 2, 3, 3, 4, 4, 4, 4, 5, 5, 6, 6];
        const UNARY_PRIORITY: u8 = 10;

        // Start with a unary operator, a bracket, or an atom.
        self.skip_whitespace();
        let mut val = match self.current_char() {
            Some('"') => self.parse_quoted_string()?,

            Some('-') => {
                self.advance();
                match self.parse_internal(evaluate, UNARY_PRIORITY)? {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Float(f, decimals) => Value::Float(-f, decimals),
                    _ => return Err(self.error("expected numeric value after '-'")),
                }
            }

            Some('+') => {
                self.advance();
                match self.parse_internal(evaluate, UNARY_PRIORITY)? {
                    // Unary plus converts an enumeration to an integer.
                    Value::Uint(u) => Value::Int(u as i32),
                    // And a date-time to a seconds count.
                    v @ Value::DateTime(_) => Value::Int(v.payload_56bit() as i64 as i32),
                    v @ (Value::Int(_) | Value::Float(..)) => v,
                    _ => {
                        return Err(self.error("expected numeric or enumeration value after '+'"))
                    }
                }
            }

            Some('#') => {
                self.advance();
                self.skip_whitespace();
                if matches!(self.current_char(), Some(c) if c.is_ascii_alphabetic()) {
                    // Applying # to an object-model array: ask the model for
                    // just the length instead of materialising the array.
                    self.parse_identifier_expression(evaluate, true, false)?
                } else {
                    match self.parse_internal(evaluate, UNARY_PRIORITY)? {
                        v if v.is_string() => {
                            Value::Int(v.as_str().map_or(0, |s| s.chars().count()) as i32)
                        }
                        _ => {
                            return Err(
                                self.error("expected object model value or string after '#'")
                            )
                        }
                    }
                }
            }

            Some('{') => {
                self.advance();
                self.parse_expect_ket(evaluate, '}')?
            }

            Some('(') => {
                self.advance();
                self.parse_expect_ket(evaluate, ')')?
            }

            Some('!') => {
                self.advance();
                let mut operand = self.parse_internal(evaluate, UNARY_PRIORITY)?;
                self.convert_to_bool(&mut operand, evaluate)?;
                match operand {
                    Value::Bool(b) => Value::Bool(!b),
                    _ => unreachable!("convert_to_bool yields a Boolean"),
                }
            }

            Some(c) if c.is_ascii_digit() => self.parse_number()?,

            Some(c) if c.is_ascii_alphabetic() => {
                self.parse_identifier_expression(evaluate, false, false)?
            }

            _ => return Err(self.error("expected an expression")),
        };

        // Fold in binary operators of higher priority.
        loop {
            self.skip_whitespace();
            let op_char = match self.current_char() {
                Some(c) => c,
                None => return Ok(val),
            };
            let op_index = match OPERATORS.iter().position(|&op| op as char == op_char) {
                Some(i) => i,
                None => return Ok(val),
            };
            let op_prio = PRIORITIES[op_index];
            if op_prio <= priority {
                return Ok(val);
            }
            self.advance();

            // Multi-character operators: != and >= and <= ...
            let mut op_char = op_char;
            let mut invert = false;
            if op_char == '!' {
                if self.current_char() != Some('=') {
                    return Err(self.error("expected '='"));
                }
                invert = true;
                self.advance();
                op_char = '=';
            } else if (op_char == '>' || op_char == '<') && self.current_char() == Some('=') {
                invert = true;
                self.advance();
                op_char = if op_char == '>' { '<' } else { '>' };
            }
            // ... and == && || as aliases for = & |.
            if matches!(op_char, '=' | '&' | '|') && self.current_char() == Some(op_char) {
                self.advance();
            }

            match op_char {
                '&' => {
                    self.convert_to_bool(&mut val, evaluate)?;
                    let lhs = matches!(val, Value::Bool(true));
                    let mut val2 = self.parse_internal(evaluate && lhs, op_prio)?;
                    if lhs {
                        self.convert_to_bool(&mut val2, evaluate)?;
                        val = val2;
                    }
                }

                '|' => {
                    self.convert_to_bool(&mut val, evaluate)?;
                    let lhs = matches!(val, Value::Bool(true));
                    let mut val2 = self.parse_internal(evaluate && !lhs, op_prio)?;
                    if !lhs {
                        self.convert_to_bool(&mut val2, evaluate)?;
                        val = val2;
                    }
                }

                '?' => {
                    self.convert_to_bool(&mut val, evaluate)?;
                    let condition = matches!(val, Value::Bool(true));
                    let second = self.parse_internal(evaluate && condition, op_prio)?;
                    if self.current_char() != Some(':') {
                        return Err(self.error("expected ':'"));
                    }
                    self.advance();
                    // The third operand may itself be a conditional
                    // expression; the ternary associates right.
                    let third = self.parse_internal(evaluate && !condition, op_prio - 1)?;
                    return Ok(if condition { second } else { third });
                }

                _ => {
                    let mut val2 = self.parse_internal(evaluate, op_prio)?;
                    val = self.apply_binary(op_char, invert, val, &mut val2, evaluate)?;
                }
            }
        }
    }

    fn apply_binary(
        &mut self,
        op_char: char,
        invert: bool,
        mut val: Value,
        val2: &mut Value,
        evaluate: bool,
    ) -> Result<Value, ParseError> {
        match op_char {
            '+' => {
                if let Value::DateTime(payload) = val {
                    match *val2 {
                        Value::Uint(u) => Ok(Value::datetime(payload + u as u64)),
                        Value::Int(i) => Ok(Value::datetime((payload as i64 + i as i64) as u64)),
                        _ if evaluate => Err(self.error("invalid operand types")),
                        _ => Ok(val),
                    }
                } else {
                    self.balance_numeric_types(&mut val, val2, evaluate)?;
                    match (&val, &*val2) {
                        (Value::Float(a, da), Value::Float(b, db)) => {
                            Ok(Value::Float(a + b, (*da).max(*db)))
                        }
                        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
                        _ => unreachable!("operands are balanced"),
                    }
                }
            }

            '-' => {
                if let Value::DateTime(payload) = val {
                    match *val2 {
                        Value::DateTime(other) => {
                            // Difference of two date-times is a seconds count.
                            Ok(Value::Int((payload as i64 - other as i64) as i32))
                        }
                        Value::Uint(u) => Ok(Value::datetime((payload as i64 - u as i64) as u64)),
                        Value::Int(i) => Ok(Value::datetime((payload as i64 - i as i64) as u64)),
                        _ if evaluate => Err(self.error("invalid operand types")),
                        _ => Ok(val),
                    }
                } else {
                    self.balance_numeric_types(&mut val, val2, evaluate)?;
                    match (&val, &*val2) {
                        (Value::Float(a, da), Value::Float(b, db)) => {
                            Ok(Value::Float(a - b, (*da).max(*db)))
                        }
                        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
                        _ => unreachable!("operands are balanced"),
                    }
                }
            }

            '*' => {
                self.balance_numeric_types(&mut val, val2, evaluate)?;
                match (&val, &*val2) {
                    (Value::Float(a, da), Value::Float(b, db)) => {
                        Ok(Value::Float(a * b, (*da).max(*db)))
                    }
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
                    _ => unreachable!("operands are balanced"),
                }
            }

            '/' => {
                self.convert_to_float(&mut val, evaluate)?;
                self.convert_to_float(val2, evaluate)?;
                match (&val, &*val2) {
                    (Value::Float(a, _), Value::Float(b, _)) => {
                        Ok(Value::Float(a / b, MAX_FLOAT_DIGITS))
                    }
                    _ => unreachable!("operands are floats"),
                }
            }

            '>' | '<' => {
                self.balance_types(&mut val, val2, evaluate)?;
                let swap = op_char == '<';
                let (a, b): (&Value, &Value) = if swap { (&*val2, &val) } else { (&val, &*val2) };
                let mut result = match (a, b) {
                    (Value::Int(x), Value::Int(y)) => x > y,
                    (Value::Float(x, _), Value::Float(y, _)) => x > y,
                    (Value::DateTime(x), Value::DateTime(y)) => x > y,
                    (Value::Bool(x), Value::Bool(y)) => *x && !*y,
                    _ => {
                        if evaluate {
                            return Err(
                                self.error("expected numeric or Boolean operands to comparison operator")
                            );
                        }
                        false
                    }
                };
                if invert {
                    result = !result;
                }
                Ok(Value::Bool(result))
            }

            '=' => {
                // Equality against null is true only for null; check before
                // balancing.
                let mut result = if matches!(val, Value::Null) {
                    matches!(*val2, Value::Null)
                } else if matches!(*val2, Value::Null) {
                    false
                } else {
                    self.balance_types(&mut val, val2, evaluate)?;
                    match (&val, &*val2) {
                        (Value::Object(_), _) | (_, Value::Object(_)) => {
                            return Err(self.error("cannot compare objects"));
                        }
                        (Value::Int(a), Value::Int(b)) => a == b,
                        (Value::Uint(a), Value::Uint(b)) => a == b,
                        (Value::Float(a, _), Value::Float(b, _)) => a == b,
                        (Value::DateTime(a), Value::DateTime(b)) => a == b,
                        (Value::Bool(a), Value::Bool(b)) => a == b,
                        (a, b) if a.is_string() && b.is_string() => a.as_str() == b.as_str(),
                        _ => {
                            if evaluate {
                                return Err(
                                    self.error("unexpected operand type to equality operator")
                                );
                            }
                            false
                        }
                    }
                };
                if invert {
                    result = !result;
                }
                Ok(Value::Bool(result))
            }

            '^' => {
                let mut text = String::new();
                val.append_as_string(&mut text);
                val2.append_as_string(&mut text);
                Ok(Value::Str(text))
            }

            _ => unreachable!("unhandled binary operator"),
        }
    }

    // Evaluate a bracketed expression.
    fn parse_expect_ket(&mut self, evaluate: bool, closing: char) -> Result<Value, ParseError> {
        let val = self.parse_internal(evaluate, 0)?;
        if self.current_char() != Some(closing) {
            return Err(self.error(format!("expected '{}'", closing)));
        }
        self.advance();
        Ok(val)
    }

    // Parse a number; the current character is a decimal digit. Hex
    // literals produce unsigned values; anything with a decimal point or
    // exponent produces a float carrying its displayed-digit count.
    fn parse_number(&mut self) -> Result<Value, ParseError> {
        if self.current_char() == Some('0')
            && matches!(self.input.get(self.pos + 1), Some(b'x') | Some(b'X'))
        {
            self.advance();
            self.advance();
            let mut raw = String::new();
            while let Some(c) = self.current_char() {
                if c.is_ascii_hexdigit() {
                    raw.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            if raw.is_empty() {
                return Err(self.error("expected hexadecimal digits"));
            }
            return match u64::from_str_radix(&raw, 16) {
                Ok(v) if v <= u32::MAX as u64 => Ok(Value::Uint(v as u32)),
                Ok(v) => Ok(Value::uint64(v)),
                Err(_) => Err(self.error("number too large")),
            };
        }

        let mut raw = String::new();
        let mut digits_after_point = 0u8;
        let mut is_float = false;
        while let Some(c) = self.current_char() {
            if c.is_ascii_digit() {
                raw.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.current_char() == Some('.') {
            is_float = true;
            raw.push('.');
            self.advance();
            while let Some(c) = self.current_char() {
                if c.is_ascii_digit() {
                    raw.push(c);
                    digits_after_point = digits_after_point.saturating_add(1);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.current_char(), Some('e') | Some('E')) {
            // Only an exponent if digits follow, so `2e` stays `2` + `e`.
            let mut lookahead = self.pos + 1;
            if matches!(self.input.get(lookahead), Some(b'+') | Some(b'-')) {
                lookahead += 1;
            }
            if matches!(self.input.get(lookahead), Some(b) if b.is_ascii_digit()) {
                is_float = true;
                raw.push('e');
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.current_char() {
                    raw.push(sign);
                    self.advance();
                }
                while let Some(c) = self.current_char() {
                    if c.is_ascii_digit() {
                        raw.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        if !is_float {
            if let Ok(i) = raw.parse::<i64>() {
                if i <= i32::MAX as i64 {
                    return Ok(Value::Int(i as i32));
                }
            }
        }
        match raw.parse::<f64>() {
            Ok(v) => Ok(Value::float(v, digits_after_point.max(1))),
            Err(_) => Err(self.error(format!("invalid number '{}'", raw))),
        }
    }

    // Parse a quoted string; the current character is the double quote. Two
    // quotes represent one; a single quote lowercases a following letter.
    fn parse_quoted_string(&mut self) -> Result<Value, ParseError> {
        debug_assert_eq!(self.current_char(), Some('"'));
        self.advance();
        let mut text = String::new();
        loop {
            let mut c = match self.current_char() {
                Some(c) => c,
                None => return Err(self.error("unterminated string")),
            };
            self.advance();
            if (c as u32) < 0x20 {
                return Err(self.error("control character in string"));
            }
            if c == '"' {
                if self.current_char() != Some('"') {
                    return Ok(Value::Str(text));
                }
                self.advance();
            } else if c == '\'' {
                match self.current_char() {
                    Some(next) if next.is_ascii_alphabetic() => {
                        c = next.to_ascii_lowercase();
                        self.advance();
                    }
                    Some('\'') => {
                        self.advance();
                    }
                    _ => {}
                }
            }
            if text.len() >= MAX_STRING_EXPRESSION_LENGTH {
                return Err(self.error("string too long"));
            }
            text.push(c);
        }
    }

    // Parse an identifier: a named constant, a function call, or an
    // object-model path. With `evaluate` false the path need not exist, so
    // expressions like `a.b == null || a.b.c == 1` parse cleanly.
    fn parse_identifier_expression(
        &mut self,
        evaluate: bool,
        apply_length_operator: bool,
        apply_exists: bool,
    ) -> Result<Value, ParseError> {
        if !matches!(self.current_char(), Some(c) if c.is_ascii_alphabetic()) {
            return Err(self.error("expected an identifier"));
        }

        let mut id = String::new();
        let mut context = LookupContext::new(
            apply_length_operator,
            apply_exists,
            self.context.line_number,
            self.column(),
        );

        // Collect identifier characters; an index expression is evaluated,
        // recorded in the context, and marked with '^' in the path.
        while let Some(c) = self.current_char() {
            let marker = if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.advance();
                c
            } else if c == '[' {
                self.advance();
                let index = self.parse_internal(evaluate, 0)?;
                if self.current_char() != Some(']') {
                    return Err(self.error("expected ']'"));
                }
                let index = match index {
                    Value::Int(i) => i,
                    _ if evaluate => return Err(self.error("expected integer expression")),
                    _ => 0,
                };
                self.advance();
                if context.provide_index(index).is_err() {
                    return Err(self.error("too many array indices"));
                }
                '^'
            } else {
                break;
            };
            if id.len() >= MAX_VARIABLE_NAME_LENGTH {
                return Err(self.error("variable name too long"));
            }
            id.push(marker);
        }

        // Named constants first.
        match id.as_str() {
            "true" | "false" | "null" | "pi" | "iterations" | "result" | "line" => {
                if apply_exists {
                    return Err(self.error("invalid 'exists' expression"));
                }
                return match id.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" => Ok(Value::Null),
                    "pi" => Ok(Value::float(std::f64::consts::PI, MAX_FLOAT_DIGITS)),
                    "iterations" => match self.context.iterations {
                        Some(i) => Ok(Value::Int(i)),
                        None => Err(self.error("'iterations' used when not inside a loop")),
                    },
                    "result" => Ok(Value::Int(self.context.last_result)),
                    _ => Ok(Value::Int(self.context.line_number as i32)),
                };
            }
            _ => {}
        }

        // Function call?
        self.skip_whitespace();
        if self.current_char() == Some('(') {
            if apply_exists {
                return Err(self.error("invalid 'exists' expression"));
            }
            let func = match Function::from_name(&id) {
                Some(f) => f,
                None => return Err(self.error("unknown function")),
            };
            self.advance();

            let result = if func == Function::Exists {
                self.skip_whitespace();
                self.parse_identifier_expression(evaluate, false, true)?
            } else {
                let operand = self.parse_internal(evaluate, 0)?;
                self.apply_function(func, operand, evaluate)?
            };

            self.skip_whitespace();
            if self.current_char() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.advance();
            return Ok(result);
        }

        // Otherwise an object-model path. Unevaluated branches must not
        // query the model: the path may legitimately not exist.
        if !evaluate {
            return Ok(Value::Null);
        }
        if apply_exists {
            return Ok(Value::Bool(self.model.lookup(&context, &id).is_some()));
        }
        match self.model.lookup(&context, &id) {
            Some(value) => Ok(value),
            None => Err(self.error(format!("unknown value '{}'", id))),
        }
    }

    fn apply_function(
        &mut self,
        func: Function,
        mut rslt: Value,
        evaluate: bool,
    ) -> Result<Value, ParseError> {
        match func {
            Function::Abs => match rslt {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                Value::Float(f, decimals) => Ok(Value::Float(f.abs(), decimals)),
                _ if evaluate => Err(self.error("expected numeric operand")),
                _ => Ok(Value::Int(0)),
            },

            Function::Sin
            | Function::Cos
            | Function::Tan
            | Function::Asin
            | Function::Acos
            | Function::Atan
            | Function::Sqrt
            | Function::Degrees
            | Function::Radians => {
                self.convert_to_float(&mut rslt, evaluate)?;
                let f = match rslt {
                    Value::Float(f, _) => f,
                    _ => unreachable!("operand is a float"),
                };
                let out = match func {
                    Function::Sin => f.sin(),
                    Function::Cos => f.cos(),
                    Function::Tan => f.tan(),
                    Function::Asin => f.asin(),
                    Function::Acos => f.acos(),
                    Function::Atan => f.atan(),
                    Function::Sqrt => f.sqrt(),
                    Function::Degrees => f * RADIANS_TO_DEGREES,
                    _ => f * DEGREES_TO_RADIANS,
                };
                Ok(Value::Float(out, MAX_FLOAT_DIGITS))
            }

            Function::Atan2 => {
                self.convert_to_float(&mut rslt, evaluate)?;
                let mut second = self.parse_next_operand(evaluate)?;
                self.convert_to_float(&mut second, evaluate)?;
                match (rslt, second) {
                    (Value::Float(y, _), Value::Float(x, _)) => {
                        Ok(Value::Float(y.atan2(x), MAX_FLOAT_DIGITS))
                    }
                    _ => unreachable!("operands are floats"),
                }
            }

            Function::Isnan => {
                self.convert_to_float(&mut rslt, evaluate)?;
                match rslt {
                    Value::Float(f, _) => Ok(Value::Bool(f.is_nan())),
                    _ => unreachable!("operand is a float"),
                }
            }

            Function::Floor => {
                self.convert_to_float(&mut rslt, evaluate)?;
                match rslt {
                    Value::Float(f, decimals) => {
                        let floored = f.floor();
                        if floored <= i32::MAX as f64 && floored >= i32::MIN as f64 {
                            Ok(Value::Int(floored as i32))
                        } else {
                            Ok(Value::Float(floored, decimals))
                        }
                    }
                    _ => unreachable!("operand is a float"),
                }
            }

            Function::Mod => {
                let mut second = self.parse_next_operand(evaluate)?;
                self.balance_numeric_types(&mut rslt, &mut second, evaluate)?;
                match (&rslt, &second) {
                    (Value::Float(a, da), Value::Float(b, db)) => {
                        Ok(Value::Float(a % b, (*da).max(*db)))
                    }
                    (Value::Int(_), Value::Int(0)) => Ok(Value::Int(0)),
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
                    _ => unreachable!("operands are balanced"),
                }
            }

            Function::Max | Function::Min => {
                loop {
                    self.skip_whitespace();
                    if self.current_char() != Some(',') {
                        break;
                    }
                    self.advance();
                    let mut next = self.parse_internal(evaluate, 0)?;
                    self.balance_numeric_types(&mut rslt, &mut next, evaluate)?;
                    rslt = match (&rslt, &next) {
                        (Value::Float(a, da), Value::Float(b, db)) => {
                            let v = if func == Function::Max { a.max(*b) } else { a.min(*b) };
                            Value::Float(v, (*da).max(*db))
                        }
                        (Value::Int(a), Value::Int(b)) => {
                            Value::Int(if func == Function::Max {
                                *a.max(b)
                            } else {
                                *a.min(b)
                            })
                        }
                        _ => unreachable!("operands are balanced"),
                    };
                }
                Ok(rslt)
            }

            Function::Random => {
                if !evaluate {
                    return Ok(Value::Int(0));
                }
                let limit = match rslt {
                    Value::Uint(u) if u > 0 => u,
                    Value::Int(i) if i > 0 => i as u32,
                    _ => return Err(self.error("expected positive integer")),
                };
                use rand::Rng;
                Ok(Value::Int(rand::thread_rng().gen_range(0..limit) as i32))
            }

            Function::Datetime => {
                if !evaluate {
                    return Ok(Value::datetime(0));
                }
                let seconds = match &rslt {
                    Value::Int(i) => (*i).max(0) as u64,
                    Value::Uint(u) => *u as u64,
                    Value::Uint64(_) | Value::DateTime(_) => rslt.payload_56bit(),
                    v if v.is_string() => match v.as_str().and_then(parse_datetime) {
                        Some(s) => s,
                        None => {
                            return Err(self.error("string is not a valid date and time"));
                        }
                    },
                    _ => return Err(self.error("can't convert value to DateTime")),
                };
                Ok(Value::datetime(seconds))
            }

            Function::Exists => unreachable!("exists is handled by the caller"),
        }
    }

    // Skip a comma and parse the next function argument.
    fn parse_next_operand(&mut self, evaluate: bool) -> Result<Value, ParseError> {
        self.skip_whitespace();
        if self.current_char() != Some(',') {
            return Err(self.error("expected ','"));
        }
        self.advance();
        self.skip_whitespace();
        self.parse_internal(evaluate, 0)
    }

    fn balance_numeric_types(
        &self,
        val1: &mut Value,
        val2: &mut Value,
        evaluate: bool,
    ) -> Result<(), ParseError> {
        // Unsigned operands always widen to float.
        if matches!(val1, Value::Uint(_) | Value::Uint64(_)) {
            self.convert_to_float(val1, evaluate)?;
        }
        if matches!(val2, Value::Uint(_) | Value::Uint64(_)) {
            self.convert_to_float(val2, evaluate)?;
        }

        if matches!(val1, Value::Float(..)) {
            self.convert_to_float(val2, evaluate)?;
        } else if matches!(val2, Value::Float(..)) {
            self.convert_to_float(val1, evaluate)?;
        } else if !(matches!(val1, Value::Int(_)) && matches!(val2, Value::Int(_))) {
            if evaluate {
                return Err(self.error("expected numeric operands"));
            }
            *val1 = Value::Int(0);
            *val2 = Value::Int(0);
        }
        Ok(())
    }

    // Bring both operands of a comparison to a common type.
    fn balance_types(
        &self,
        val1: &mut Value,
        val2: &mut Value,
        evaluate: bool,
    ) -> Result<(), ParseError> {
        if matches!(val1, Value::Uint(_) | Value::Uint64(_)) {
            self.convert_to_float(val1, evaluate)?;
        }
        if matches!(val2, Value::Uint(_) | Value::Uint64(_)) {
            self.convert_to_float(val2, evaluate)?;
        }

        if std::mem::discriminant(val1) == std::mem::discriminant(val2)
            || (val1.is_string() && val2.is_string())
        {
            // Nothing to do.
        } else if matches!(val1, Value::Float(..)) {
            self.convert_to_float(val2, evaluate)?;
        } else if matches!(val2, Value::Float(..)) {
            self.convert_to_float(val1, evaluate)?;
        } else if val2.is_string() && val1.has_no_literals() {
            self.convert_to_string(val1, evaluate);
        } else if val1.is_string() && val2.has_no_literals() {
            self.convert_to_string(val2, evaluate);
        } else if evaluate {
            return Err(self.error("cannot convert operands to same type"));
        } else {
            *val1 = Value::Int(0);
            *val2 = Value::Int(0);
        }
        Ok(())
    }

    fn convert_to_float(&self, val: &mut Value, evaluate: bool) -> Result<(), ParseError> {
        *val = match val {
            Value::Uint(u) => Value::Float(*u as f64, 1),
            Value::Uint64(_) => Value::Float(val.payload_56bit() as f64, 1),
            Value::Int(i) => Value::Float(*i as f64, 1),
            Value::Float(..) => return Ok(()),
            _ if evaluate => return Err(self.error("expected numeric operand")),
            _ => Value::Float(0.0, 1),
        };
        Ok(())
    }

    // Booleans pass through; integers are accepted with the C convention
    // that nonzero is true.
    fn convert_to_bool(&self, val: &mut Value, evaluate: bool) -> Result<(), ParseError> {
        *val = match val {
            Value::Bool(_) => return Ok(()),
            Value::Int(i) => Value::Bool(*i != 0),
            Value::Uint(u) => Value::Bool(*u != 0),
            _ if evaluate => return Err(self.error("expected Boolean operand")),
            _ => Value::Bool(false),
        };
        Ok(())
    }

    fn convert_to_string(&self, val: &mut Value, evaluate: bool) {
        if !val.is_string() {
            if evaluate {
                let mut text = String::new();
                val.append_as_string(&mut text);
                *val = Value::Str(text);
            } else {
                *val = Value::StaticStr("");
            }
        }
    }

    fn convert_to_driver_id(&self, val: &mut Value, evaluate: bool) -> Result<(), ParseError> {
        *val = match *val {
            Value::Driver(_) => return Ok(()),
            Value::Int(i) if i >= 0 => Value::Driver(DriverId {
                board: 0,
                port: i as u32,
            }),
            Value::Float(f, _) => {
                let f10 = 10.0 * f;
                let ival = f10.round() as i64;
                if ival >= 0 && (f10 - ival as f64).abs() <= 0.002 {
                    Value::Driver(DriverId {
                        board: (ival / 10) as u32,
                        port: (ival % 10) as u32,
                    })
                } else {
                    return Err(self.error("invalid driver ID"));
                }
            }
            _ if evaluate => return Err(self.error("expected driver ID")),
            _ => return Ok(()),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct TestModel {
        lookups: RefCell<Vec<String>>,
        length_requests: RefCell<Vec<String>>,
        last_indices: RefCell<Vec<i32>>,
    }

    impl TestModel {
        fn new() -> Self {
            Self {
                lookups: RefCell::new(Vec::new()),
                length_requests: RefCell::new(Vec::new()),
                last_indices: RefCell::new(Vec::new()),
            }
        }
    }

    impl ObjectModel for TestModel {
        fn lookup(&self, context: &LookupContext, path: &str) -> Option<Value> {
            self.lookups.borrow_mut().push(path.to_string());
            *self.last_indices.borrow_mut() = context.indices().to_vec();
            if context.want_length() {
                self.length_requests.borrow_mut().push(path.to_string());
            }
            match path {
                "global.answer" => Some(Value::Int(42)),
                "move.speed" => Some(Value::float(31.5, 1)),
                "tools" => Some(if context.want_length() {
                    Value::Int(3)
                } else {
                    Value::Object(crate::value::ObjectHandle(7))
                }),
                "axes^.homed" => Some(Value::Bool(true)),
                _ => None,
            }
        }
    }

    fn eval(text: &str) -> Result<Value, ParseError> {
        let model = TestModel::new();
        ExpressionParser::new(text, &model, EvalContext::default()).parse()
    }

    fn eval_ok(text: &str) -> Value {
        eval(text).unwrap_or_else(|err| panic!("'{}' failed: {}", text, err))
    }

    #[test]
    fn integer_arithmetic_and_precedence() {
        assert_eq!(eval_ok("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval_ok("(1 + 2) * 3"), Value::Int(9));
        assert_eq!(eval_ok("{1 + 2} * 3"), Value::Int(9));
        assert_eq!(eval_ok("10 - 2 - 3"), Value::Int(5));
    }

    #[test]
    fn division_always_yields_float() {
        assert_eq!(eval_ok("1/2"), Value::Float(0.5, MAX_FLOAT_DIGITS));
        assert_eq!(eval_ok("4/2"), Value::Float(2.0, MAX_FLOAT_DIGITS));
    }

    #[test]
    fn modulo_via_function() {
        assert_eq!(eval_ok("mod(5, 3)"), Value::Int(2));
        assert_eq!(eval_ok("mod(5, 0)"), Value::Int(0));
    }

    #[test]
    fn boolean_operators_short_circuit() {
        assert_eq!(eval_ok("true && false"), Value::Bool(false));
        assert_eq!(eval_ok("true || false"), Value::Bool(true));
        // The unevaluated operand may reference unknown paths...
        assert_eq!(eval_ok("false && unknown.path"), Value::Bool(false));
        assert_eq!(eval_ok("true || unknown.path"), Value::Bool(true));
        // ...but its syntax is still checked.
        assert!(eval("false && (1").is_err());
    }

    #[test]
    fn ternary_evaluates_exactly_one_branch() {
        let model = TestModel::new();
        let v = ExpressionParser::new("true ? 1 : global.answer", &model, EvalContext::default())
            .parse()
            .unwrap();
        assert_eq!(v, Value::Int(1));
        assert!(model.lookups.borrow().is_empty());

        let v = ExpressionParser::new("false ? global.answer : 2", &model, EvalContext::default())
            .parse()
            .unwrap();
        assert_eq!(v, Value::Int(2));
        assert!(model.lookups.borrow().is_empty());

        // Nested ternaries associate right.
        assert_eq!(eval_ok("false ? 1 : true ? 2 : 3"), Value::Int(2));
    }

    #[test]
    fn length_operator_on_strings_and_arrays() {
        assert_eq!(eval_ok("#\"hello\""), Value::Int(5));

        let model = TestModel::new();
        let v = ExpressionParser::new("#tools", &model, EvalContext::default())
            .parse()
            .unwrap();
        assert_eq!(v, Value::Int(3));
        // The model was asked for the length, not the array.
        assert_eq!(model.length_requests.borrow().as_slice(), ["tools"]);
    }

    #[test]
    fn null_equality_laws() {
        assert_eq!(eval_ok("null = null"), Value::Bool(true));
        assert_eq!(eval_ok("null == null"), Value::Bool(true));
        assert_eq!(eval_ok("null = 0"), Value::Bool(false));
        assert_eq!(eval_ok("0 != null"), Value::Bool(true));
    }

    #[test]
    fn quoted_string_escapes() {
        assert_eq!(eval_ok("\"he\"\"llo\""), Value::Str("he\"llo".to_string()));
        // A single quote lowercases the next letter.
        assert_eq!(eval_ok("\"'A\""), Value::Str("a".to_string()));
        // Two single quotes represent one.
        assert_eq!(eval_ok("\"''\""), Value::Str("'".to_string()));
    }

    #[test]
    fn comparison_chain_with_boolean_tail() {
        assert_eq!(eval_ok("2 + 3 > 4 && 1"), Value::Bool(true));
    }

    #[test]
    fn comparison_aliases_and_inversions() {
        assert_eq!(eval_ok("1 == 1"), Value::Bool(true));
        assert_eq!(eval_ok("1 != 2"), Value::Bool(true));
        assert_eq!(eval_ok("2 >= 2"), Value::Bool(true));
        assert_eq!(eval_ok("1 <= 0"), Value::Bool(false));
        assert_eq!(eval_ok("2 > 1"), Value::Bool(true));
        assert_eq!(eval_ok("true > false"), Value::Bool(true));
    }

    #[test]
    fn numeric_comparison_balances_types() {
        assert_eq!(eval_ok("1 = 1.0"), Value::Bool(true));
        assert_eq!(eval_ok("0.5 < 1"), Value::Bool(true));
    }

    #[test]
    fn string_comparison_uses_content() {
        assert_eq!(eval_ok("\"abc\" = \"abc\""), Value::Bool(true));
        assert_eq!(eval_ok("\"abc\" = \"abd\""), Value::Bool(false));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval_ok("\"a\" ^ \"b\""), Value::Str("ab".to_string()));
        assert_eq!(eval_ok("\"x\" ^ 1"), Value::Str("x1".to_string()));
        assert_eq!(eval_ok("1 ^ 2"), Value::Str("12".to_string()));
    }

    #[test]
    fn unary_operators() {
        assert_eq!(eval_ok("-3"), Value::Int(-3));
        assert_eq!(eval_ok("+3"), Value::Int(3));
        assert_eq!(eval_ok("!true"), Value::Bool(false));
        assert_eq!(eval_ok("!!true"), Value::Bool(true));
        assert!(eval("-\"abc\"").is_err());
    }

    #[test]
    fn named_constants() {
        assert_eq!(eval_ok("true"), Value::Bool(true));
        assert_eq!(eval_ok("null"), Value::Null);
        match eval_ok("pi") {
            Value::Float(f, _) => assert!((f - std::f64::consts::PI).abs() < 1e-12),
            other => panic!("pi was {:?}", other),
        }

        let model = TestModel::new();
        let context = EvalContext {
            line_number: 17,
            iterations: Some(3),
            last_result: 1,
        };
        let mut parser = ExpressionParser::new("iterations + line + result", &model, context);
        assert_eq!(parser.parse().unwrap(), Value::Int(21));

        // Outside a loop, `iterations` is an error.
        assert!(eval("iterations").unwrap_err().message.contains("loop"));
    }

    #[test]
    fn math_functions() {
        assert_eq!(eval_ok("abs(-3)"), Value::Int(3));
        match eval_ok("sqrt(16)") {
            Value::Float(f, _) => assert!((f - 4.0).abs() < 1e-12),
            other => panic!("sqrt was {:?}", other),
        }
        assert_eq!(eval_ok("floor(2.7)"), Value::Int(2));
        assert_eq!(eval_ok("floor(-0.5)"), Value::Int(-1));
        match eval_ok("degrees(pi)") {
            Value::Float(f, _) => assert!((f - 180.0).abs() < 1e-9),
            other => panic!("degrees was {:?}", other),
        }
        match eval_ok("atan2(0, 1)") {
            Value::Float(f, _) => assert!(f.abs() < 1e-12),
            other => panic!("atan2 was {:?}", other),
        }
        assert_eq!(eval_ok("isnan(0/0)"), Value::Bool(true));
        assert_eq!(eval_ok("isnan(1.0)"), Value::Bool(false));
    }

    #[test]
    fn min_max_are_variadic() {
        assert_eq!(eval_ok("max(1, 2, 3)"), Value::Int(3));
        assert_eq!(eval_ok("min(5, 2, 9)"), Value::Int(2));
        match eval_ok("max(1, 2.5, 2)") {
            Value::Float(f, _) => assert!((f - 2.5).abs() < 1e-12),
            other => panic!("max was {:?}", other),
        }
    }

    #[test]
    fn random_needs_a_positive_limit() {
        for _ in 0..20 {
            match eval_ok("random(8)") {
                Value::Int(i) => assert!((0..8).contains(&i)),
                other => panic!("random was {:?}", other),
            }
        }
        assert!(eval("random(0)").is_err());
        assert!(eval("random(-4)").is_err());
    }

    #[test]
    fn datetime_conversions_and_arithmetic() {
        let base = eval_ok("datetime(\"2023-01-01T00:00:00\")");
        assert!(matches!(base, Value::DateTime(_)));
        assert_eq!(
            eval_ok("datetime(\"2023-01-01T00:00:00\") + 60 = datetime(\"2023-01-01T00:01:00\")"),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("datetime(\"2023-01-01T00:00:00\") < datetime(\"2023-06-01T00:00:00\")"),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("datetime(\"2023-01-01T00:01:00\") - datetime(\"2023-01-01T00:00:00\")"),
            Value::Int(60)
        );
        // Unary plus turns a date-time into a seconds count.
        assert_eq!(eval_ok("+datetime(60)"), Value::Int(60));
        assert!(eval("datetime(\"not a date\")").is_err());
    }

    #[test]
    fn exists_is_structural() {
        assert_eq!(eval_ok("exists(global.answer)"), Value::Bool(true));
        assert_eq!(eval_ok("exists(no.such.path)"), Value::Bool(false));
        assert!(eval("exists(true)").is_err());
        assert!(eval("exists(1)").is_err());
    }

    #[test]
    fn object_model_lookups_and_indices() {
        let model = TestModel::new();
        let v = ExpressionParser::new("axes[2].homed", &model, EvalContext::default())
            .parse()
            .unwrap();
        assert_eq!(v, Value::Bool(true));
        assert_eq!(model.lookups.borrow().as_slice(), ["axes^.homed"]);
        assert_eq!(model.last_indices.borrow().as_slice(), [2]);
    }

    #[test]
    fn unknown_value_reports_path() {
        let err = eval("no.such.value").unwrap_err();
        assert!(err.message.contains("no.such.value"), "{}", err.message);
    }

    #[test]
    fn errors_carry_position() {
        let err = eval("1 + ").unwrap_err();
        assert_eq!(err.column, 5);

        let model = TestModel::new();
        let context = EvalContext {
            line_number: 12,
            ..EvalContext::default()
        };
        let err = ExpressionParser::new("1 + ", &model, context).parse().unwrap_err();
        assert_eq!(err.line, 12);
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut text = String::new();
        for _ in 0..64 {
            text.push('(');
        }
        text.push('1');
        for _ in 0..64 {
            text.push(')');
        }
        let err = eval(&text).unwrap_err();
        assert!(err.message.contains("nesting too deep"), "{}", err.message);

        // A reasonable depth still parses.
        assert_eq!(eval_ok("((((1))))"), Value::Int(1));
    }

    #[test]
    fn extra_characters_are_detected() {
        let model = TestModel::new();
        let mut parser = ExpressionParser::new("1 + 2 junk", &model, EvalContext::default());
        parser.parse().unwrap();
        assert!(parser.check_for_extra_characters().is_err());
    }

    #[test]
    fn hex_literals_are_unsigned() {
        assert_eq!(eval_ok("0xff"), Value::Uint(255));
        // Unsigned widens to float in arithmetic.
        match eval_ok("0x10 + 0.5") {
            Value::Float(f, _) => assert!((f - 16.5).abs() < 1e-12),
            other => panic!("hex arithmetic was {:?}", other),
        }
    }

    #[test]
    fn float_literals_remember_displayed_digits() {
        assert_eq!(eval_ok("1.50"), Value::Float(1.5, 2));
        assert_eq!(eval_ok("2.5e1"), Value::Float(25.0, 1));
    }

    #[test]
    fn typed_wrappers() {
        let model = TestModel::new();
        assert_eq!(
            ExpressionParser::new("2 + 3", &model, EvalContext::default())
                .parse_integer()
                .unwrap(),
            5
        );
        assert!(
            (ExpressionParser::new("1/4", &model, EvalContext::default())
                .parse_float()
                .unwrap()
                - 0.25)
                .abs()
                < 1e-12
        );
        assert!(ExpressionParser::new("3 > 2", &model, EvalContext::default())
            .parse_boolean()
            .unwrap());
        assert!(ExpressionParser::new("-1", &model, EvalContext::default())
            .parse_unsigned()
            .is_err());
        let id = ExpressionParser::new("1.2", &model, EvalContext::default())
            .parse_driver_id()
            .unwrap();
        assert_eq!(id, DriverId { board: 1, port: 2 });
    }
}
