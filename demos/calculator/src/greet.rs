//! Greet service.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem::{
    BidiStream, CallContext, Client, ClientStreamingCall, ResponseSink, Router, RouterError,
    Status, Streaming,
};

pub const GREET: &str = "greet.Greet";
pub const GREET_MANY_TIMES: &str = "greet.GreetManyTimes";
pub const LONG_GREET: &str = "greet.LongGreet";
pub const GREET_EVERYONE: &str = "greet.GreetEveryone";
pub const GREET_WITH_DEADLINE: &str = "greet.GreetWithDeadline";

/// Greetings sent by `GreetManyTimes`.
pub const MANY_TIMES: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub first_name: String,
    pub last_name: String,
}

impl Greeting {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetResponse {
    pub result: String,
}

#[derive(Clone, Debug)]
pub struct Greeter {
    /// Pause between `GreetManyTimes` messages.
    pause: Duration,
    /// One unit of work in `GreetWithDeadline`.
    step: Duration,
    steps: u32,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            pause: Duration::from_millis(1000),
            step: Duration::from_secs(1),
            steps: 3,
        }
    }
}

impl Greeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_work(mut self, step: Duration, steps: u32) -> Self {
        self.step = step;
        self.steps = steps;
        self
    }

    pub fn greet(&self, greeting: Greeting) -> GreetResponse {
        GreetResponse {
            result: format!("Hello {}", greeting.first_name),
        }
    }

    pub async fn greet_many_times(
        &self,
        greeting: Greeting,
        sink: ResponseSink<GreetResponse>,
    ) -> Result<(), Status> {
        for i in 0..MANY_TIMES {
            sink.send(GreetResponse {
                result: format!("Hello {} number {}", greeting.first_name, i),
            })
            .await?;
            if i + 1 < MANY_TIMES && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        Ok(())
    }

    pub async fn long_greet(
        &self,
        mut greetings: Streaming<Greeting>,
    ) -> Result<GreetResponse, Status> {
        let mut result = String::new();
        while let Some(greeting) = greetings.message().await? {
            result.push_str(&format!("Hello {}! ", greeting.first_name));
        }
        Ok(GreetResponse { result })
    }

    pub async fn greet_everyone(
        &self,
        mut greetings: Streaming<Greeting>,
        sink: ResponseSink<GreetResponse>,
    ) -> Result<(), Status> {
        while let Some(greeting) = greetings.message().await? {
            sink.send(GreetResponse {
                result: format!("Hello {}! ", greeting.first_name),
            })
            .await?;
        }
        Ok(())
    }

    /// Slow greeting that gives up as soon as the caller does.
    pub async fn greet_with_deadline(
        &self,
        ctx: CallContext,
        greeting: Greeting,
    ) -> Result<GreetResponse, Status> {
        for step in 0..self.steps {
            if let Some(status) = ctx.err() {
                tracing::info!(step, code = %status.code(), "client gave up on greeting");
                return Err(status);
            }
            ctx.run(tokio::time::sleep(self.step)).await?;
        }
        Ok(GreetResponse {
            result: format!("Hello {}", greeting.first_name),
        })
    }
}

pub fn register(router: &mut Router, service: Arc<Greeter>) -> Result<(), RouterError> {
    let svc = service.clone();
    router.unary(GREET, move |_ctx, greeting: Greeting| {
        let svc = svc.clone();
        async move { Ok(svc.greet(greeting)) }
    })?;

    let svc = service.clone();
    router.server_streaming(GREET_MANY_TIMES, move |_ctx, greeting: Greeting, sink| {
        let svc = svc.clone();
        async move { svc.greet_many_times(greeting, sink).await }
    })?;

    let svc = service.clone();
    router.client_streaming(LONG_GREET, move |_ctx, greetings| {
        let svc = svc.clone();
        async move { svc.long_greet(greetings).await }
    })?;

    let svc = service.clone();
    router.bidi_streaming(GREET_EVERYONE, move |_ctx, greetings, sink| {
        let svc = svc.clone();
        async move { svc.greet_everyone(greetings, sink).await }
    })?;

    let svc = service;
    router.unary(GREET_WITH_DEADLINE, move |ctx, greeting: Greeting| {
        let svc = svc.clone();
        async move { svc.greet_with_deadline(ctx, greeting).await }
    })?;

    Ok(())
}

#[derive(Clone, Debug)]
pub struct GreetClient {
    client: Client,
}

impl GreetClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn greet(&self, ctx: &CallContext, greeting: Greeting) -> Result<String, Status> {
        let response: GreetResponse = self.client.unary(GREET, ctx, greeting).await?;
        Ok(response.result)
    }

    pub async fn greet_many_times(
        &self,
        ctx: &CallContext,
        greeting: Greeting,
    ) -> Result<Streaming<GreetResponse>, Status> {
        self.client
            .server_streaming(GREET_MANY_TIMES, ctx, greeting)
            .await
    }

    pub async fn long_greet(
        &self,
        ctx: &CallContext,
    ) -> Result<ClientStreamingCall<Greeting, GreetResponse>, Status> {
        self.client.client_streaming(LONG_GREET, ctx).await
    }

    pub async fn greet_everyone(
        &self,
        ctx: &CallContext,
    ) -> Result<BidiStream<Greeting, GreetResponse>, Status> {
        self.client.bidi_streaming(GREET_EVERYONE, ctx).await
    }

    pub async fn greet_with_deadline(
        &self,
        ctx: &CallContext,
        greeting: Greeting,
    ) -> Result<String, Status> {
        let response: GreetResponse = self
            .client
            .unary(GREET_WITH_DEADLINE, ctx, greeting)
            .await?;
        Ok(response.result)
    }
}
