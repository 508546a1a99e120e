//! tandem-calculator: serve the demo services, or drive them as a client.
//!
//! # Usage
//!
//! ```bash
//! tandem-calculator serve --addr 127.0.0.1:50051
//! tandem-calculator --addr 127.0.0.1:50051 calculator
//! tandem-calculator --addr 127.0.0.1:50051 greet --deadline-ms 1000
//! tandem-calculator --addr 127.0.0.1:50051 blog
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tandem::{CallContext, Server, SessionConfig, Status};
use tandem_calculator::blog::Blog;
use tandem_calculator::calculator::{AverageRequest, MaximumRequest};
use tandem_calculator::greet::Greeting;
use tandem_calculator::{BlogClient, CalculatorClient, GreetClient, Greeter, Services};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tandem-calculator")]
#[command(about = "Calculator, greet and blog services over tandem")]
struct Args {
    /// Address to listen on or connect to
    #[arg(long, global = true, env = "TANDEM_ADDR", default_value = "127.0.0.1:50051")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve every demo service
    Serve {
        /// Pause between GreetManyTimes messages, in milliseconds
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },
    /// Call each calculator method once
    Calculator,
    /// Call each greet method once
    Greet {
        /// Deadline for GreetWithDeadline, in milliseconds
        #[arg(long, default_value_t = 5000)]
        deadline_ms: u64,
    },
    /// Create, read, update, delete and list blog posts
    Blog,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Serve { pause_ms } => serve(&args.addr, config, pause_ms).await,
        command => run_client(&args.addr, config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn serve(
    addr: &str,
    config: SessionConfig,
    pause_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let services = Services::new(Greeter::new().with_pause(Duration::from_millis(pause_ms)));
    let router = services.router()?;
    tracing::info!(methods = ?router.methods(), "serving");
    let server = Server::new(router).with_config(config);
    tandem::server::run_tcp_server(addr, server).await?;
    Ok(())
}

async fn run_client(
    addr: &str,
    config: SessionConfig,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = tandem::connect_with_config(addr, config).await?;
    tracing::info!(addr, "connected");

    match command {
        Command::Calculator => run_calculator(CalculatorClient::new(client.clone())).await,
        Command::Greet { deadline_ms } => {
            run_greet(
                GreetClient::new(client.clone()),
                Duration::from_millis(deadline_ms),
            )
            .await
        }
        Command::Blog => run_blog(BlogClient::new(client.clone())).await,
        Command::Serve { .. } => {}
    }

    client.close();
    Ok(())
}

/// Print a failed call with its status code; the walkthrough carries on.
fn report(what: &str, status: &Status) {
    println!("{} failed: {}", what, status);
}

async fn run_calculator(calculator: CalculatorClient) {
    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

    match calculator.sum(&ctx, 3, 10).await {
        Ok(result) => println!("Sum(3, 10) = {}", result),
        Err(status) => report("Sum", &status),
    }

    match calculator.prime_number_decomposition(&ctx, 120).await {
        Ok(factors) => match factors.collect_all().await {
            Ok(factors) => {
                let factors: Vec<i64> = factors.iter().map(|f| f.factor).collect();
                println!("PrimeNumberDecomposition(120) = {:?}", factors);
            }
            Err(status) => report("PrimeNumberDecomposition", &status),
        },
        Err(status) => report("PrimeNumberDecomposition", &status),
    }

    let average = async {
        let mut call = calculator.compute_average(&ctx).await?;
        for value in [1.0, 2.0, 3.0, 4.0] {
            call.send(AverageRequest { value }).await?;
        }
        call.close_and_recv().await
    };
    match average.await {
        Ok(response) => println!("ComputeAverage([1, 2, 3, 4]) = {}", response.result),
        Err(status) => report("ComputeAverage", &status),
    }

    let maximum = async {
        let mut call = calculator.find_maximum(&ctx).await?;
        for value in [1, 5, 3, 6, 2, 20] {
            call.send(MaximumRequest { value })?;
        }
        call.close_send();
        let mut maxima = Vec::new();
        while let Some(response) = call.message().await? {
            maxima.push(response.result);
        }
        Ok::<_, Status>(maxima)
    };
    match maximum.await {
        Ok(maxima) => println!("FindMaximum([1, 5, 3, 6, 2, 20]) = {:?}", maxima),
        Err(status) => report("FindMaximum", &status),
    }

    for number in [10, -2] {
        match calculator.square_root(&ctx, number).await {
            Ok(root) => println!("SquareRoot({}) = {}", number, root),
            Err(status) => report(&format!("SquareRoot({})", number), &status),
        }
    }
}

async fn run_greet(greet: GreetClient, deadline: Duration) {
    let ctx = CallContext::new().with_timeout(Duration::from_secs(30));
    let juan = Greeting::new("Juan", "Arias");

    match greet.greet(&ctx, juan.clone()).await {
        Ok(result) => println!("Greet: {}", result),
        Err(status) => report("Greet", &status),
    }

    match greet.greet_many_times(&ctx, juan.clone()).await {
        Ok(mut stream) => loop {
            match stream.message().await {
                Ok(Some(response)) => println!("GreetManyTimes: {}", response.result),
                Ok(None) => break,
                Err(status) => {
                    report("GreetManyTimes", &status);
                    break;
                }
            }
        },
        Err(status) => report("GreetManyTimes", &status),
    }

    let names = ["JP", "Andres", "John", "Ruth"];

    let long_greet = async {
        let mut call = greet.long_greet(&ctx).await?;
        for name in names {
            call.send(Greeting::new(name, "")).await?;
        }
        call.close_and_recv().await
    };
    match long_greet.await {
        Ok(response) => println!("LongGreet: {}", response.result),
        Err(status) => report("LongGreet", &status),
    }

    match greet.greet_everyone(&ctx).await {
        Ok(call) => {
            let (requests, mut responses) = call.into_parts();
            let sender = tokio::spawn(async move {
                for name in names {
                    if let Err(status) = requests.send(Greeting::new(name, "")) {
                        report("GreetEveryone send", &status);
                        break;
                    }
                }
                requests.close_send();
            });
            loop {
                match responses.message().await {
                    Ok(Some(response)) => println!("GreetEveryone: {}", response.result),
                    Ok(None) => break,
                    Err(status) => {
                        report("GreetEveryone", &status);
                        break;
                    }
                }
            }
            let _ = sender.await;
        }
        Err(status) => report("GreetEveryone", &status),
    }

    let bounded = CallContext::new().with_timeout(deadline);
    match greet.greet_with_deadline(&bounded, juan).await {
        Ok(result) => println!("GreetWithDeadline: {}", result),
        Err(status) => report("GreetWithDeadline", &status),
    }
}

async fn run_blog(blog: BlogClient) {
    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

    let created = match blog
        .create(
            &ctx,
            Blog::new("Stephane", "My First Blog", "Content of the first blog"),
        )
        .await
    {
        Ok(created) => {
            println!("CreateBlog: {:?}", created);
            created
        }
        Err(status) => {
            report("CreateBlog", &status);
            return;
        }
    };

    match blog.read(&ctx, u64::MAX).await {
        Ok(found) => println!("ReadBlog(missing): unexpectedly found {:?}", found),
        Err(status) => report("ReadBlog(missing)", &status),
    }

    match blog.read(&ctx, created.id).await {
        Ok(found) => println!("ReadBlog: {:?}", found),
        Err(status) => report("ReadBlog", &status),
    }

    let edited = Blog {
        title: "My First Blog (Edited)".to_string(),
        content: "Content of the first blog, with some awesome additions!".to_string(),
        ..created.clone()
    };
    match blog.update(&ctx, edited).await {
        Ok(updated) => println!("UpdateBlog: {:?}", updated),
        Err(status) => report("UpdateBlog", &status),
    }

    match blog.delete(&ctx, created.id).await {
        Ok(id) => println!("DeleteBlog: {}", id),
        Err(status) => report("DeleteBlog", &status),
    }

    match blog.list(&ctx).await {
        Ok(posts) => match posts.collect_all().await {
            Ok(posts) => {
                println!("ListBlog: {} post(s)", posts.len());
                for post in posts {
                    println!("  {:?}", post);
                }
            }
            Err(status) => report("ListBlog", &status),
        },
        Err(status) => report("ListBlog", &status),
    }
}
