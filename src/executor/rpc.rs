//! Generic-execute transport over PostgREST RPC

use crate::error::RemoteFailure;
use crate::executor::Transport;
use crate::supabase::SupabaseClient;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct ExecArgs<'a> {
    query: &'a str,
}

/// Sends each statement as `{"query": "..."}` to the generic execute function
pub struct RpcTransport {
    client: Arc<SupabaseClient>,
    function: String,
}

impl RpcTransport {
    pub fn new(client: Arc<SupabaseClient>, function: impl Into<String>) -> Self {
        Self {
            client,
            function: function.into(),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn execute(&self, sql: &str) -> Result<(), RemoteFailure> {
        self.client.rpc(&self.function, &ExecArgs { query: sql }).await
    }
}
