pub mod embedding_service;
pub mod orchestrator;
pub mod prompt_builder;
pub mod repairer;
pub mod retriever;
pub mod schema_store;
pub mod schema_sync;
pub mod sql_executor;
pub mod sql_generator;
pub mod sql_validator;

#[cfg(test)]
pub mod test_support;
