// flowc — Flow Plan Compiler
//
// Library root. Passes run in module order: validate, normalize, plan,
// shuffle, stage; `pipeline` drives them.

pub mod builder;
pub mod datamodel;
pub mod diag;
pub mod dot;
pub mod graph;
pub mod id;
pub mod manifest;
pub mod normalize;
pub mod pass;
pub mod pipeline;
pub mod plan;
pub mod registry;
pub mod report;
pub mod shuffle;
pub mod stage;
pub mod validate;
