pub(crate) mod support;

mod pipeline_tests;
mod undo_tests;
