//! A couple of toy `JobHandler`s used to seed and exercise the worker when
//! there's no real job source wired up yet.

use async_trait::async_trait;
use taskforge_core::exception::ExceptionInfo;
use taskforge_core::job::Job;

use crate::worker::JobHandler;

/// Always succeeds, echoing back its invocation arguments.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn call(&self, job: &Job) -> Result<serde_json::Value, ExceptionInfo> {
        Ok(serde_json::json!({ "echoed": job.invocation.arguments }))
    }
}

/// Always fails, to demonstrate the automatic-retry filter driving a job
/// through its full Scheduled/Failed cycle until it gives up.
pub struct AlwaysFailsHandler;

#[async_trait]
impl JobHandler for AlwaysFailsHandler {
    async fn call(&self, _job: &Job) -> Result<serde_json::Value, ExceptionInfo> {
        Err(ExceptionInfo::new("IOException", "simulated failure for demo purposes"))
    }
}
