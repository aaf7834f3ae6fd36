pub mod engine;
pub mod files;
pub mod matrix;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod site;
pub mod types;
pub mod vcf;
pub mod worker;
