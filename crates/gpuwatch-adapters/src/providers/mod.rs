pub mod coreweave;
pub mod datacrunch;
pub mod lambda_labs;
pub mod runpod;
pub mod vast_ai;

pub const PROVIDER_SLUGS: [&str; 5] = ["lambda-labs", "runpod", "vast-ai", "coreweave", "datacrunch"];
