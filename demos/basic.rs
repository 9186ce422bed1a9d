//! Minimal plum example: nested groups, middleware, JSON endpoints.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:8080/hello
//!   curl http://localhost:8080/2/3/hello
//!   curl http://localhost:8080/api/users/42 -H 'x-token: secret'
//!   curl -X POST http://localhost:8080/api/users \
//!        -H 'x-token: secret' -H 'content-type: application/json' \
//!        -d '{"id":7,"name":"alice"}'
//!   curl http://localhost:8080/panic
//!   curl http://localhost:8080/debug/pprof/goroutine

use std::time::Duration;

use plum::{Context, HandlerFunc, Options, Server, StatusCode, middleware};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
struct User {
    id: u64,
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), plum::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new(
        Options::default()
            .read_header_timeout(Duration::from_secs(10))
            .request_deadline(Duration::from_secs(30))
            .handle_signals(true),
    );
    server.use_middleware([HandlerFunc::from(middleware::trace)]);

    server.get("/hello", hello);
    server.group("/1").get("/hello", hello);
    let two = server.group("/2");
    two.get("/hello", hello);
    two.group("/3").get("/hello", hello);
    server.get("/panic", boom);

    let api = server.group_with("/api", [HandlerFunc::from(require_token)]);
    api.get("/users/{id}", get_user);
    api.post("/users", create_user);

    server.run("0.0.0.0:8080").await
}

fn hello(ctx: &mut Context) {
    let uri = ctx.request().uri().to_string();
    ctx.json(StatusCode::OK, format!("hello from :{uri}"));
}

// Recovered by the built-in middleware: logged, answered with 500.
fn boom(_: &mut Context) {
    panic!("something went wrong");
}

fn require_token(ctx: &mut Context) {
    if ctx.header("x-token") != Some("secret") {
        ctx.abort_with_status_json(StatusCode::UNAUTHORIZED, serde_json::json!({ "error": "missing token" }));
        return;
    }
    ctx.set("caller", "demo".to_owned());
    ctx.next();
}

// GET /api/users/{id}
fn get_user(ctx: &mut Context) {
    let Ok(id) = ctx.param("id").unwrap_or_default().parse() else {
        ctx.abort_with_status(StatusCode::BAD_REQUEST);
        return;
    };
    let caller = ctx.get::<String>("caller").unwrap_or_default();
    ctx.json(StatusCode::OK, User { id, name: format!("seen by {caller}") });
}

// POST /api/users
fn create_user(ctx: &mut Context) {
    let Ok(user) = ctx.must_bind_with::<User, _>(&plum::binding::Json) else { return };
    ctx.set_header("location", &format!("/api/users/{}", user.id));
    ctx.json(StatusCode::CREATED, user);
}
