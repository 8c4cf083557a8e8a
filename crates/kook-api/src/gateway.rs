//! `GET gateway/index`: where to open the event stream.

use serde::Deserialize;

use crate::request::{ApiPath, ApiRequest};

/// Position to pick a session back up from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub sn: u64,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetGateway {
    compress: bool,
    resume: Option<ResumeInfo>,
}

impl GetGateway {
    pub fn new(compress: bool) -> Self {
        Self {
            compress,
            resume: None,
        }
    }

    pub fn resume(compress: bool, sn: u64, session_id: impl Into<String>) -> Self {
        Self {
            compress,
            resume: Some(ResumeInfo {
                sn,
                session_id: session_id.into(),
            }),
        }
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn resume_info(&self) -> Option<&ResumeInfo> {
        self.resume.as_ref()
    }
}

impl ApiRequest for GetGateway {
    type Output = Gateway;

    fn path(&self) -> ApiPath {
        ApiPath::new(["gateway", "index"])
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("compress", if self.compress { "1" } else { "0" }.to_owned())];
        if let Some(resume) = &self.resume {
            query.push(("resume", "1".to_owned()));
            query.push(("sn", resume.sn.to_string()));
            query.push(("session_id", resume.session_id.clone()));
        }
        query
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Gateway {
    pub url: String,
}
