#![recursion_limit = "256"]

pub mod boxes;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod data;
pub mod dataset;
pub mod debug;
pub mod detect;
pub mod error;
pub mod inference;
pub mod labels;
pub mod levels;
pub mod loss;
pub mod matcher;
pub mod models;
pub mod nms;
pub mod priors;
pub mod schedule;
pub mod stats;
pub mod training;
pub mod transforms;
