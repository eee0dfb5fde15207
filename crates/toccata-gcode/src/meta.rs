//! Conditional meta-commands of the job-file language: `if`/`elif`/`else`,
//! `while`/`break`, `echo` and `abort`.
//!
//! Blocks are delimited by indentation. Each block on the stack carries a
//! state that decides whether its lines execute, and loop blocks remember
//! the file position to rewind to.

use crate::expression::{EvalContext, ExpressionParser, ObjectModel, ParseError};

pub const MAX_BLOCK_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockType {
    #[default]
    Plain,
    /// An if-block whose condition was true.
    IfTrue,
    /// An if/elif-block whose condition was false, no earlier branch taken.
    IfFalseNoneTrue,
    /// An if/elif-block skipped because an earlier branch was taken.
    IfFalseHadTrue,
    Loop,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockState {
    block_type: BlockType,
    file_position: u64,
    line_number: u32,
    iterations: i32,
    indent: u16,
}

impl BlockState {
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn file_position(&self) -> u64 {
        self.file_position
    }

    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    pub fn iterations(&self) -> i32 {
        self.iterations
    }

    fn set_plain(&mut self) {
        self.block_type = BlockType::Plain;
    }

    fn set_if_true(&mut self) {
        self.block_type = BlockType::IfTrue;
    }

    fn set_if_false_none_true(&mut self) {
        self.block_type = BlockType::IfFalseNoneTrue;
    }

    fn set_if_false_had_true(&mut self) {
        self.block_type = BlockType::IfFalseHadTrue;
    }

    fn set_loop(&mut self, file_position: u64, line_number: u32) {
        self.block_type = BlockType::Loop;
        self.file_position = file_position;
        self.line_number = line_number;
        self.iterations = 0;
    }

    fn increment_iterations(&mut self) {
        self.iterations += 1;
    }
}

/// Fixed-depth stack of blocks. The base block always exists.
#[derive(Debug)]
struct BlockStack {
    blocks: [BlockState; MAX_BLOCK_DEPTH],
    depth: usize,
}

impl BlockStack {
    fn new() -> Self {
        Self {
            blocks: [BlockState::default(); MAX_BLOCK_DEPTH],
            depth: 1,
        }
    }

    fn current(&self) -> &BlockState {
        &self.blocks[self.depth - 1]
    }

    fn current_mut(&mut self) -> &mut BlockState {
        &mut self.blocks[self.depth - 1]
    }

    fn indent_level(&self) -> u16 {
        self.current().indent
    }

    fn create_block(&mut self, indent: u16) -> Result<(), ()> {
        if self.depth == MAX_BLOCK_DEPTH {
            return Err(());
        }
        self.blocks[self.depth] = BlockState {
            indent,
            ..BlockState::default()
        };
        self.depth += 1;
        Ok(())
    }

    fn end_block(&mut self) {
        debug_assert!(self.depth > 1);
        self.depth -= 1;
    }

    /// Iteration count of the innermost enclosing loop.
    fn iterations(&self) -> Option<i32> {
        self.blocks[..self.depth]
            .iter()
            .rev()
            .find(|block| block.block_type == BlockType::Loop)
            .map(|block| block.iterations)
    }
}

/// What the caller should do with the line just processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaAction {
    /// The line was a meta-command, or is being skipped; nothing to run.
    Skipped,
    /// An ordinary command line: execute it.
    Command,
    /// A loop block ended: seek back and continue from the recorded place.
    Rewind { file_position: u64, line_number: u32 },
    /// An `echo` command produced output.
    Echo(String),
    /// An `abort` command; the optional message was already evaluated.
    Abort(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    If,
    Elif,
    Else,
    While,
    Break,
    Echo,
    Abort,
}

/// Recognise a meta keyword at the start of an indent-stripped line.
/// Keywords are 2..=5 lowercase letters terminated by end-of-line,
/// whitespace or '{'; returns the keyword and the argument text.
pub fn parse_keyword(rest: &str) -> Option<(Keyword, &str)> {
    let word_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_lowercase())
        .count()
        .min(6);
    if !(2..6).contains(&word_len) {
        return None;
    }
    match rest.as_bytes().get(word_len) {
        None | Some(b' ') | Some(b'\t') | Some(b'{') => {}
        _ => return None,
    }
    let keyword = match &rest[..word_len] {
        "if" => Keyword::If,
        "elif" => Keyword::Elif,
        "else" => Keyword::Else,
        "while" => Keyword::While,
        "break" => Keyword::Break,
        "echo" => Keyword::Echo,
        "abort" => Keyword::Abort,
        _ => return None,
    };
    Some((keyword, rest[word_len..].trim_start_matches([' ', '\t'])))
}

fn split_indent(line: &str) -> (u16, &str) {
    let indent = line
        .bytes()
        .take_while(|&b| b == b' ' || b == b'\t')
        .count();
    (indent as u16, &line[indent..])
}

/// The block state machine. Feed it lines in file order; on a
/// [`MetaAction::Rewind`] the caller seeks the file and resumes from the
/// returned position.
pub struct MetaProcessor<'m> {
    model: &'m dyn ObjectModel,
    stack: BlockStack,
    indent_to_skip_to: Option<u16>,
    last_result: i32,
}

impl<'m> MetaProcessor<'m> {
    pub fn new(model: &'m dyn ObjectModel) -> Self {
        Self {
            model,
            stack: BlockStack::new(),
            indent_to_skip_to: None,
            last_result: 0,
        }
    }

    /// Record the result code of the last executed command, for the
    /// `result` named constant.
    pub fn set_last_result(&mut self, result: i32) {
        self.last_result = result;
    }

    /// Iteration count of the innermost loop, if inside one.
    pub fn iterations(&self) -> Option<i32> {
        self.stack.iterations()
    }

    fn eval_context(&self, line_number: u32) -> EvalContext {
        EvalContext {
            line_number,
            iterations: self.stack.iterations(),
            last_result: self.last_result,
        }
    }

    fn evaluate_condition(
        &self,
        expr: &str,
        line_number: u32,
        column: usize,
    ) -> Result<bool, ParseError> {
        let context = self.eval_context(line_number);
        let mut parser = ExpressionParser::with_column(expr, self.model, context, column);
        let condition = parser.parse_boolean()?;
        parser.check_for_extra_characters()?;
        Ok(condition)
    }

    fn error(line_number: u32, column: usize, message: &str) -> ParseError {
        ParseError {
            line: line_number,
            column,
            message: message.to_string(),
        }
    }

    /// Process one line of the job file. `file_position` is whatever the
    /// caller needs to seek back to this line.
    pub fn process_line(
        &mut self,
        line: &str,
        line_number: u32,
        file_position: u64,
    ) -> Result<MetaAction, ParseError> {
        let (indent, rest) = split_indent(line);
        if rest.is_empty() || rest.starts_with(';') {
            return Ok(MetaAction::Skipped);
        }

        let mut previous_block_type = BlockType::Plain;
        if let Some(skip_to) = self.indent_to_skip_to {
            if skip_to < indent {
                // Still inside the block being skipped.
                return Ok(MetaAction::Skipped);
            }
            if skip_to == indent {
                previous_block_type = self.stack.current().block_type();
                self.stack.current_mut().set_plain();
            }
            self.indent_to_skip_to = None;
        }

        let column = (indent + 1) as usize;
        if indent > self.stack.indent_level() {
            if self.stack.create_block(indent).is_err() {
                return Err(Self::error(line_number, column, "blocks nested too deeply"));
            }
        } else if indent < self.stack.indent_level() {
            if let Some(action) = self.end_blocks(indent) {
                return Ok(action);
            }
        }

        let (keyword, args) = match parse_keyword(rest) {
            Some(found) => found,
            None => return Ok(MetaAction::Command),
        };
        let args_column = (line.len() - args.len() + 1).max(column);

        match keyword {
            Keyword::If => {
                if self.evaluate_condition(args, line_number, args_column)? {
                    self.stack.current_mut().set_if_true();
                } else {
                    self.stack.current_mut().set_if_false_none_true();
                    self.indent_to_skip_to = Some(self.stack.indent_level());
                }
                Ok(MetaAction::Skipped)
            }

            Keyword::Elif => {
                // The branch state is either in the block (the previous
                // branch executed) or was saved when skipping it ended.
                let branch_state = if previous_block_type != BlockType::Plain {
                    previous_block_type
                } else {
                    self.stack.current().block_type()
                };
                match branch_state {
                    BlockType::IfFalseNoneTrue => {
                        if self.evaluate_condition(args, line_number, args_column)? {
                            self.stack.current_mut().set_if_true();
                        } else {
                            self.indent_to_skip_to = Some(self.stack.indent_level());
                            self.stack.current_mut().set_if_false_none_true();
                        }
                    }
                    BlockType::IfTrue | BlockType::IfFalseHadTrue => {
                        // An earlier branch ran; skip this one.
                        self.indent_to_skip_to = Some(self.stack.indent_level());
                        self.stack.current_mut().set_if_false_had_true();
                    }
                    _ => {
                        return Err(Self::error(
                            line_number,
                            column,
                            "'elif' did not follow 'if'",
                        ));
                    }
                }
                Ok(MetaAction::Skipped)
            }

            Keyword::Else => {
                let branch_state = if previous_block_type != BlockType::Plain {
                    previous_block_type
                } else {
                    self.stack.current().block_type()
                };
                match branch_state {
                    BlockType::IfFalseNoneTrue => {
                        // Execute the else-block like a plain block.
                        self.stack.current_mut().set_plain();
                    }
                    BlockType::IfTrue | BlockType::IfFalseHadTrue => {
                        self.indent_to_skip_to = Some(self.stack.indent_level());
                        // A second 'else' at this level is now an error.
                        self.stack.current_mut().set_plain();
                    }
                    _ => {
                        return Err(Self::error(
                            line_number,
                            column,
                            "'else' did not follow 'if'",
                        ));
                    }
                }
                Ok(MetaAction::Skipped)
            }

            Keyword::While => {
                // Mark the block as a loop before evaluating, so the
                // condition may use 'iterations'.
                if self.stack.current().block_type() == BlockType::Loop {
                    self.stack.current_mut().increment_iterations();
                } else {
                    self.stack
                        .current_mut()
                        .set_loop(file_position, line_number);
                }
                if !self.evaluate_condition(args, line_number, args_column)? {
                    self.stack.current_mut().set_plain();
                    self.indent_to_skip_to = Some(self.stack.indent_level());
                }
                Ok(MetaAction::Skipped)
            }

            Keyword::Break => {
                loop {
                    if self.stack.depth == 1 {
                        return Err(Self::error(
                            line_number,
                            column,
                            "'break' was not inside a loop",
                        ));
                    }
                    self.stack.end_block();
                    if self.stack.current().block_type() == BlockType::Loop {
                        break;
                    }
                }
                self.stack.current_mut().set_plain();
                Ok(MetaAction::Skipped)
            }

            Keyword::Echo => {
                if args.is_empty() {
                    return Ok(MetaAction::Echo(String::new()));
                }
                let context = self.eval_context(line_number);
                let mut parser =
                    ExpressionParser::with_column(args, self.model, context, args_column);
                let mut text = String::new();
                loop {
                    let value = parser.parse()?;
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    value.append_as_string(&mut text);
                    if !parser.try_consume(',') {
                        break;
                    }
                }
                parser.check_for_extra_characters()?;
                Ok(MetaAction::Echo(text))
            }

            Keyword::Abort => {
                if args.is_empty() {
                    return Ok(MetaAction::Abort(None));
                }
                // If the message expression fails to evaluate we abort
                // anyway.
                let context = self.eval_context(line_number);
                let mut parser =
                    ExpressionParser::with_column(args, self.model, context, args_column);
                let message = parser.parse().ok().map(|value| {
                    let mut text = String::new();
                    value.append_as_string(&mut text);
                    text
                });
                Ok(MetaAction::Abort(message))
            }
        }
    }

    /// The file ended: close any open blocks. Returns a rewind action if an
    /// open loop block must run again.
    pub fn end_of_file(&mut self) -> Option<MetaAction> {
        self.end_blocks(0)
    }

    // Pop blocks deeper than `indent`; ending a loop body rewinds to the
    // loop head.
    fn end_blocks(&mut self, indent: u16) -> Option<MetaAction> {
        while self.stack.indent_level() > indent {
            self.stack.end_block();
            if self.stack.current().block_type() == BlockType::Loop {
                return Some(MetaAction::Rewind {
                    file_position: self.stack.current().file_position(),
                    line_number: self.stack.current().line_number(),
                });
            }
        }
        None
    }
}
