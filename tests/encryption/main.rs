//! Integration tests for key store providers and the encrypted command pipeline.

mod pipeline;
mod providers;
mod support;
