use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("record error: {0}")]
    Record(#[from] crate::model::RecordError),
    #[error("config error: {0}")]
    Config(#[from] crate::plugin::ConfigError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;
