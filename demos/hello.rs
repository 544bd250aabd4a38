//! The hello service.
//!
//! ```text
//! cargo run --example hello
//!
//! # long-lived connection, prints every post sent to "rest"
//! curl "http://127.0.0.1:8080/prefix/hello/rest/streaming"
//!
//! curl "http://127.0.0.1:8080/prefix/hello" -d '{"to":"rest", "post":"rest is powerful"}'
//! curl "http://127.0.0.1:8080/prefix/hello/rest"
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use restive::{Context, Declaration, Handlers, Mailbox, Router, Server, Service, StatusCode, Stream, mailbox};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

#[derive(Default)]
struct RestExample {
    post: Mutex<HashMap<String, String>>,
    watch: Mutex<HashMap<String, Mailbox<String>>>,
}

#[derive(Default, Deserialize, Serialize)]
struct HelloArg {
    to: String,
    post: String,
}

impl Service for RestExample {
    fn declare(d: &mut Declaration) {
        d.anchor(r#"prefix:"/prefix" mime:"application/json" charset:"utf-8""#)
            .processor("CreateHello", r#"method:"POST" path:"/hello""#)
            .processor("GetHello", r#"method:"GET" path:"/hello/:to" func:"HandleHello""#)
            .streaming("Watch", r#"method:"GET" path:"/hello/:to/streaming""#)
            .field("post")
            .field("watch");
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor_with_body("HandleCreateHello", RestExample::create_hello)
            .processor("HandleHello", RestExample::hello)
            .streaming("HandleWatch", RestExample::watch);
    }
}

// A poisoned map is still a usable map for a demo.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RestExample {
    async fn create_hello(self: Arc<Self>, _: Context, (): (), arg: HelloArg) {
        if let Some(mailbox) = lock(&self.watch).get(&arg.to) {
            mailbox.offer(arg.post.clone());
        }
        lock(&self.post).insert(arg.to, arg.post);
    }

    async fn hello(self: Arc<Self>, mut ctx: Context, (): ()) -> HelloArg {
        let to = ctx.var("to").unwrap_or_default().to_owned();
        let post = lock(&self.post).get(&to).cloned();
        match post {
            Some(post) => HelloArg { to, post },
            None => {
                ctx.error(StatusCode::NOT_FOUND, format_args!("can't find hello to {to}"));
                HelloArg::default()
            }
        }
    }

    async fn watch(self: Arc<Self>, mut ctx: Context, mut stream: Stream) {
        let Some(to) = ctx.var("to").map(str::to_owned) else {
            ctx.error(StatusCode::BAD_REQUEST, "need to");
            return;
        };

        let (mailbox, mut inbox) = mailbox();
        lock(&self.watch).insert(to.clone(), mailbox);
        let svc = Arc::clone(&self);
        let key = to.clone();
        stream.on_close(move || {
            lock(&svc.watch).remove(&key);
        });

        if ctx.write_header(StatusCode::OK).is_err() {
            return;
        }
        info!(%to, "watching");
        loop {
            tokio::select! {
                post = inbox.recv() => {
                    let Some(post) = post else { return };
                    stream.set_deadline(Instant::now() + Duration::from_secs(1));
                    if let Err(e) = stream.write(&post).await {
                        info!(%to, error = %e, "watch ended");
                        return;
                    }
                }
                () = stream.disconnected() => {
                    info!(%to, "watcher left");
                    return;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), restive::Error> {
    tracing_subscriber::fmt::init();

    let router = Router::new(RestExample::default())?;
    for route in router.routes() {
        info!(field = route.field, method = %route.method, pattern = route.pattern, "route");
    }

    Server::bind("127.0.0.1:8080")?.serve(router).await
}
