pub mod assembler;
pub mod coordinator;
pub mod epub;
pub mod fetcher;
pub mod hasher;
pub mod ledger;
pub mod pipeline;
pub mod segmenter;
pub mod source;
