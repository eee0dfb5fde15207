//! Job-file expression evaluator and conditional meta-commands.

mod expression;
mod meta;
mod value;

pub use expression::{
    EvalContext, ExpressionParser, LookupContext, NullObjectModel, ObjectModel, ParseError,
    MAX_EXPRESSION_DEPTH, MAX_INDICES,
};
pub use meta::{
    parse_keyword, BlockState, BlockType, Keyword, MetaAction, MetaProcessor, MAX_BLOCK_DEPTH,
};
pub use value::{
    format_datetime, parse_datetime, DriverId, ObjectHandle, Value, MAX_FLOAT_DIGITS,
};
