use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use micro_nio::{EngineConfig, Exchange, Server, handler_fn};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

fn route(exchange: &mut Exchange) -> Result<(), micro_nio::protocol::BoxError> {
    let method = exchange.request().method().clone();
    let path = exchange.request().uri().path().to_owned();
    info!(%method, %path, "request received");

    match (method, path.as_str()) {
        (Method::GET, "/") => {
            let response = exchange.response();
            response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))?;
            response.write_str("Hello World!\r\n")?;
        }
        (Method::POST, "/echo") => {
            let body = exchange.request().body().clone();
            exchange.response().write(&body)?;
        }
        (Method::GET, "/slow") => {
            let reattach = exchange.detach()?;
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                let resumed = reattach.resume(|exchange| {
                    exchange.response().write_str("finished later\r\n")?;
                    Ok(())
                });
                if let Err(e) = resumed {
                    error!(cause = %e, "resume failed");
                }
            });
        }
        _ => exchange.response().set_status(StatusCode::NOT_FOUND)?,
    }
    Ok(())
}

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = EngineConfig::builder().compress_responses(true).build().expect("invalid config");
    let server = match Server::builder()
        .config(config)
        .bind("127.0.0.1:8080")
        .status_bind("127.0.0.1:8081")
        .handler(handler_fn(route))
        .build()
    {
        Ok(server) => server,
        Err(e) => {
            error!(cause = %e, "invalid server setup");
            return;
        }
    };

    let handle = match server.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!(cause = %e, "failed to start");
            return;
        }
    };
    info!(address = %handle.local_addr(), "start listening");

    if let Err(e) = handle.join() {
        error!(cause = %e, "server stopped with error");
    }
}
