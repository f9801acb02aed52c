// nestc — Nest Compiler
//
// Library root. Front end (lexer, parser, resolve, graph), shape layer
// (axis, registry, signature, join, shape_infer), op IR (ir, lower), loop IR
// (lir, fusion, schedule), and drivers (pass, pipeline, render, eval, dot).

pub mod ast;
pub mod axis;
pub mod diag;
pub mod dot;
pub mod error;
pub mod eval;
pub mod fusion;
pub mod graph;
pub mod id;
pub mod ir;
pub mod join;
pub mod lexer;
pub mod lir;
pub mod lower;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod resolve;
pub mod schedule;
pub mod shape;
pub mod shape_infer;
pub mod signature;
