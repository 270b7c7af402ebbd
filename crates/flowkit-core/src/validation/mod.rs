//! Validation modules

pub mod input_schema;

pub use input_schema::{
    validate_input, InputSchema, ValidationIssue, ValidationOutcome, VariableSpec, VariableType,
};
