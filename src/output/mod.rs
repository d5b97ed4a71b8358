//! Agent output checks: strict validation of the declared result file and
//! best-effort salvage from stdout.

pub mod recovery;
pub mod validator;

pub use recovery::{RecoveredOutput, STDOUT_PARSER_VERSION, StdoutExtraction, recover_from_stdout};
pub use validator::{ValidationFailure, validate_output_bytes, validate_output_file};
