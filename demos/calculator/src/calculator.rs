//! Calculator service: one method per call shape.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tandem::{
    BidiStream, CallContext, Client, ClientStreamingCall, ResponseSink, Router, RouterError,
    Status, Streaming,
};

pub const SUM: &str = "calculator.Sum";
pub const PRIME_NUMBER_DECOMPOSITION: &str = "calculator.PrimeNumberDecomposition";
pub const COMPUTE_AVERAGE: &str = "calculator.ComputeAverage";
pub const FIND_MAXIMUM: &str = "calculator.FindMaximum";
pub const SQUARE_ROOT: &str = "calculator.SquareRoot";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumRequest {
    pub value1: i32,
    pub value2: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumResponse {
    pub result: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeNumberDecompositionRequest {
    pub number: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeFactor {
    pub factor: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AverageRequest {
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AverageResponse {
    pub result: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaximumRequest {
    pub value: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaximumResponse {
    pub result: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareRootRequest {
    pub number: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SquareRootResponse {
    pub root: f64,
}

/// Stateless arithmetic.
#[derive(Clone, Copy, Debug, Default)]
pub struct Calculator;

impl Calculator {
    pub fn new() -> Self {
        Self
    }

    fn record(&self, method: &'static str) {
        tracing::debug!(method, "calculator call");
    }

    pub fn sum(&self, request: SumRequest) -> SumResponse {
        self.record(SUM);
        SumResponse {
            result: i64::from(request.value1) + i64::from(request.value2),
        }
    }

    pub fn square_root(&self, request: SquareRootRequest) -> Result<SquareRootResponse, Status> {
        self.record(SQUARE_ROOT);
        if request.number < 0 {
            return Err(Status::invalid_argument(format!(
                "received a negative number: {}",
                request.number
            )));
        }
        Ok(SquareRootResponse {
            root: f64::from(request.number).sqrt(),
        })
    }

    /// Streams the prime factors of `number` in non-decreasing order.
    pub async fn prime_number_decomposition(
        &self,
        request: PrimeNumberDecompositionRequest,
        sink: ResponseSink<PrimeFactor>,
    ) -> Result<(), Status> {
        self.record(PRIME_NUMBER_DECOMPOSITION);
        if request.number < 1 {
            return Err(Status::invalid_argument(format!(
                "number must be at least 1, got {}",
                request.number
            )));
        }
        for factor in prime_factors(request.number) {
            sink.send(PrimeFactor { factor }).await?;
        }
        Ok(())
    }

    pub async fn compute_average(
        &self,
        mut values: Streaming<AverageRequest>,
    ) -> Result<AverageResponse, Status> {
        self.record(COMPUTE_AVERAGE);
        let mut total = 0.0;
        let mut count = 0u64;
        while let Some(request) = values.message().await? {
            total += request.value;
            count += 1;
        }
        if count == 0 {
            return Err(Status::invalid_argument(
                "cannot average an empty sequence of numbers",
            ));
        }
        Ok(AverageResponse {
            result: total / count as f64,
        })
    }

    /// Emits each value that exceeds every value seen before it.
    pub async fn find_maximum(
        &self,
        mut values: Streaming<MaximumRequest>,
        sink: ResponseSink<MaximumResponse>,
    ) -> Result<(), Status> {
        self.record(FIND_MAXIMUM);
        let mut maximum: Option<i32> = None;
        while let Some(request) = values.message().await? {
            if maximum.is_none_or(|max| request.value > max) {
                maximum = Some(request.value);
                sink.send(MaximumResponse {
                    result: request.value,
                })
                .await?;
            }
        }
        Ok(())
    }
}

/// Trial division; `1` has no prime factors.
pub fn prime_factors(mut number: i64) -> Vec<i64> {
    let mut factors = Vec::new();
    let mut divisor = 2i64;
    while number > 1 {
        if divisor.saturating_mul(divisor) > number {
            factors.push(number);
            break;
        }
        if number % divisor == 0 {
            factors.push(divisor);
            number /= divisor;
        } else {
            divisor += 1;
        }
    }
    factors
}

pub fn register(router: &mut Router, service: Arc<Calculator>) -> Result<(), RouterError> {
    let svc = service.clone();
    router.unary(SUM, move |_ctx, request: SumRequest| {
        let svc = svc.clone();
        async move { Ok(svc.sum(request)) }
    })?;

    let svc = service.clone();
    router.server_streaming(
        PRIME_NUMBER_DECOMPOSITION,
        move |_ctx, request: PrimeNumberDecompositionRequest, sink| {
            let svc = svc.clone();
            async move { svc.prime_number_decomposition(request, sink).await }
        },
    )?;

    let svc = service.clone();
    router.client_streaming(COMPUTE_AVERAGE, move |_ctx, values| {
        let svc = svc.clone();
        async move { svc.compute_average(values).await }
    })?;

    let svc = service.clone();
    router.bidi_streaming(FIND_MAXIMUM, move |_ctx, values, sink| {
        let svc = svc.clone();
        async move { svc.find_maximum(values, sink).await }
    })?;

    let svc = service;
    router.unary(SQUARE_ROOT, move |_ctx, request: SquareRootRequest| {
        let svc = svc.clone();
        async move { svc.square_root(request) }
    })?;

    Ok(())
}

/// Typed calls against a remote [`Calculator`].
#[derive(Clone, Debug)]
pub struct CalculatorClient {
    client: Client,
}

impl CalculatorClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn sum(&self, ctx: &CallContext, value1: i32, value2: i32) -> Result<i64, Status> {
        let response: SumResponse = self
            .client
            .unary(SUM, ctx, SumRequest { value1, value2 })
            .await?;
        Ok(response.result)
    }

    pub async fn prime_number_decomposition(
        &self,
        ctx: &CallContext,
        number: i64,
    ) -> Result<Streaming<PrimeFactor>, Status> {
        self.client
            .server_streaming(
                PRIME_NUMBER_DECOMPOSITION,
                ctx,
                PrimeNumberDecompositionRequest { number },
            )
            .await
    }

    pub async fn compute_average(
        &self,
        ctx: &CallContext,
    ) -> Result<ClientStreamingCall<AverageRequest, AverageResponse>, Status> {
        self.client.client_streaming(COMPUTE_AVERAGE, ctx).await
    }

    pub async fn find_maximum(
        &self,
        ctx: &CallContext,
    ) -> Result<BidiStream<MaximumRequest, MaximumResponse>, Status> {
        self.client.bidi_streaming(FIND_MAXIMUM, ctx).await
    }

    pub async fn square_root(&self, ctx: &CallContext, number: i32) -> Result<f64, Status> {
        let response: SquareRootResponse = self
            .client
            .unary(SQUARE_ROOT, ctx, SquareRootRequest { number })
            .await?;
        Ok(response.root)
    }
}
