use serde::Deserialize;
use crate::core::{Result, UploadError};

pub const SUCCESS_CODE: i32 = 200;

/// Wire shape `{code, msg, data}` shared by every endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Decoded envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse<T> {
    Ok { data: T },
    Err { code: i32, msg: String },
}

impl<T> ApiEnvelope<T> {
    pub fn decode(self) -> ApiResponse<T> {
        match (self.code, self.data) {
            (SUCCESS_CODE, Some(data)) => ApiResponse::Ok { data },
            (SUCCESS_CODE, None) => ApiResponse::Err {
                code: SUCCESS_CODE,
                msg: "response carried no data".to_string(),
            },
            (code, _) => ApiResponse::Err { code, msg: self.msg },
        }
    }

    pub fn into_result(self) -> Result<T> {
        self.decode().into_result()
    }
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            ApiResponse::Ok { data } => Ok(data),
            ApiResponse::Err { code, msg } => Err(UploadError::api(code, msg)),
        }
    }
}
