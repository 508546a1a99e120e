//! Calculator, greet and blog services over tandem.
//!
//! Each service is a plain struct shared into its handlers through an `Arc`.
//! `register` wires it into a [`Router`]; the `*Client` types wrap a
//! [`tandem::Client`] with typed calls.

use std::sync::Arc;

use tandem::{Router, RouterError};

pub mod blog;
pub mod calculator;
pub mod greet;

pub use blog::{BlogClient, BlogService};
pub use calculator::{Calculator, CalculatorClient};
pub use greet::{GreetClient, Greeter};

/// The service objects one server shares across every connection.
#[derive(Clone, Debug, Default)]
pub struct Services {
    pub calculator: Arc<Calculator>,
    pub greeter: Arc<Greeter>,
    pub blog: Arc<BlogService>,
}

impl Services {
    pub fn new(greeter: Greeter) -> Self {
        Self {
            calculator: Arc::new(Calculator::new()),
            greeter: Arc::new(greeter),
            blog: Arc::new(BlogService::new()),
        }
    }

    /// A router serving all three services.
    pub fn router(&self) -> Result<Router, RouterError> {
        let mut router = Router::new();
        calculator::register(&mut router, self.calculator.clone())?;
        greet::register(&mut router, self.greeter.clone())?;
        blog::register(&mut router, self.blog.clone())?;
        Ok(router)
    }
}
