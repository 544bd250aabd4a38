use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use restive::{Body, ConfigError, Context, Declaration, Error, Handlers, Mailbox, Router, Service, Stream, mailbox};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ── The hello service ────────────────────────────────────────────────────────

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
            .processor("Boom", r#"method:"GET" path:"/boom""#)
            .field("post")
            .field("watch");
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor_with_body("HandleCreateHello", RestExample::create_hello)
            .processor("HandleHello", RestExample::hello)
            .streaming("HandleWatch", RestExample::watch)
            .processor("HandleBoom", RestExample::boom);
    }
}

impl RestExample {
    async fn create_hello(self: Arc<Self>, _: Context, (): (), arg: HelloArg) {
        if let Some(mailbox) = self.watch.lock().unwrap().get(&arg.to) {
            mailbox.offer(arg.post.clone());
        }
        self.post.lock().unwrap().insert(arg.to, arg.post);
    }

    async fn hello(self: Arc<Self>, mut ctx: Context, (): ()) -> HelloArg {
        let to = ctx.var("to").unwrap_or_default().to_owned();
        let post = self.post.lock().unwrap().get(&to).cloned();
        match post {
            Some(post) => HelloArg { to, post },
            None => {
                ctx.error(StatusCode::NOT_FOUND, format_args!("can't find hello to {to}"));
                HelloArg::default()
            }
        }
    }

    async fn boom(self: Arc<Self>, _: Context, (): ()) {
        panic!("hello exploded");
    }

    async fn watch(self: Arc<Self>, mut ctx: Context, mut stream: Stream) {
        let Some(to) = ctx.var("to").map(str::to_owned) else {
            ctx.error(StatusCode::BAD_REQUEST, "need to");
            return;
        };

        let (mailbox, mut inbox) = mailbox();
        self.watch.lock().unwrap().insert(to.clone(), mailbox);
        let svc = Arc::clone(&self);
        stream.on_close(move || {
            svc.watch.lock().unwrap().remove(&to);
        });

        if ctx.write_header(StatusCode::OK).is_err() {
            return;
        }
        while let Some(post) = inbox.recv().await {
            stream.set_deadline(Instant::now() + Duration::from_secs(1));
            if stream.write(&post).await.is_err() {
                return;
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::from(body.to_owned())))
        .unwrap()
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    request(Method::GET, uri, "")
}

async fn text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn next_frame(response: &mut Response<Body>) -> Option<Bytes> {
    let frame = response.body_mut().frame().await?.unwrap();
    frame.into_data().ok()
}

fn hello_router() -> (Router<RestExample>, Arc<RestExample>) {
    let svc = Arc::new(RestExample::default());
    let router = Router::new(Arc::clone(&svc)).unwrap();
    (router, svc)
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn routes_are_compiled_in_declaration_order() {
    let (router, _) = hello_router();
    assert_eq!(router.prefix(), "/prefix");

    let fields: Vec<_> = router.routes().map(|r| r.field).collect();
    assert_eq!(fields, ["CreateHello", "GetHello", "Watch", "Boom"]);

    let create = router.routes().next().unwrap();
    assert_eq!(create.handler, "HandleCreateHello");
    assert_eq!(create.body, Some(std::any::type_name::<HelloArg>()));
}

#[tokio::test]
async fn missing_resource_is_404() {
    let (router, _) = hello_router();
    let response = router.dispatch(get("/prefix/hello/rest")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(text(response).await, "can't find hello to rest\n");
}

#[tokio::test]
async fn unmatched_request_is_404() {
    let (router, _) = hello_router();

    let response = router.dispatch(get("/prefix/nowhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(text(response).await, "can't find route to process GET /prefix/nowhere\n");

    // Right path, wrong method.
    let response = router.dispatch(request(Method::DELETE, "/prefix/hello/rest", "")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_then_get() {
    let (router, _) = hello_router();

    let body = r#"{"to":"rest","post":"rest is powerful"}"#;
    let response = router.dispatch(request(Method::POST, "/prefix/hello", body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "");

    let response = router.dispatch(get("/prefix/hello/rest")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/json; charset=utf-8");
    assert_eq!(text(response).await, "{\"to\":\"rest\",\"post\":\"rest is powerful\"}\n");
}

#[tokio::test]
async fn undecodable_body_is_400() {
    let (router, svc) = hello_router();
    let response = router.dispatch(request(Method::POST, "/prefix/hello", "{not json")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text(response).await.starts_with("can't marshal request to type "));
    assert!(svc.post.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn streaming_receives_pushed_posts_until_a_write_misses_its_deadline() {
    let (router, svc) = hello_router();

    let mut stream = router.dispatch(get("/prefix/hello/rest/streaming")).await;
    assert_eq!(stream.status(), StatusCode::OK);
    assert_eq!(stream.headers()[CONTENT_TYPE], "application/json; charset=utf-8");
    assert!(svc.watch.lock().unwrap().contains_key("rest"));

    let post = r#"{"to":"rest","post":"rest is powerful"}"#;
    router.dispatch(request(Method::POST, "/prefix/hello", post)).await;
    assert_eq!(next_frame(&mut stream).await.unwrap(), "\"rest is powerful\"\n");

    // Nobody reads any more: the first post fills the connection, the
    // second can't be written before its deadline.
    let first = r#"{"to":"rest","post":"first"}"#;
    let second = r#"{"to":"rest","post":"second"}"#;
    router.dispatch(request(Method::POST, "/prefix/hello", first)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    router.dispatch(request(Method::POST, "/prefix/hello", second)).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!svc.watch.lock().unwrap().contains_key("rest"), "closing the session unregisters it");

    // Later posts still succeed; there is simply nobody to deliver to.
    let late = r#"{"to":"rest","post":"late"}"#;
    let response = router.dispatch(request(Method::POST, "/prefix/hello", late)).await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(next_frame(&mut stream).await.unwrap(), "\"first\"\n");
    assert_eq!(next_frame(&mut stream).await, None);
}

#[tokio::test]
async fn panic_is_500_and_router_keeps_serving() {
    let (router, _) = hello_router();

    let response = router.dispatch(get("/prefix/boom")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text(response).await.contains("hello exploded"));

    let response = router.dispatch(get("/prefix/hello/rest")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_state_is_not_locked_by_the_framework() {
    let (router, svc) = hello_router();

    // A streaming handler holding its session open doesn't hold up others.
    let stream = router.dispatch(get("/prefix/hello/watcher/streaming")).await;
    assert_eq!(stream.status(), StatusCode::OK);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50 {
        let router = router.clone();
        tasks.spawn(async move {
            let body = format!(r#"{{"to":"to-{i}","post":"post {i}"}}"#);
            router.dispatch(request(Method::POST, "/prefix/hello", &body)).await.status()
        });
    }
    while let Some(status) = tasks.join_next().await {
        assert_eq!(status.unwrap(), StatusCode::OK);
    }

    // Every write landed because the service guards its own map.
    assert_eq!(svc.post.lock().unwrap().len(), 50);
    drop(stream);
}

// ── Streaming edges ──────────────────────────────────────────────────────────

struct Streams;

impl Service for Streams {
    fn declare(d: &mut Declaration) {
        d.anchor(r#"prefix:"/s""#)
            .streaming("Quiet", r#"method:"GET" path:"/quiet""#)
            .streaming("Crash", r#"method:"GET" path:"/crash""#)
            .streaming("Reject", r#"method:"GET" path:"/reject""#)
            .streaming("Twice", r#"method:"GET" path:"/twice""#);
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.streaming("HandleQuiet", Streams::quiet)
            .streaming("HandleCrash", Streams::crash)
            .streaming("HandleReject", Streams::reject)
            .streaming("HandleTwice", Streams::twice);
    }
}

impl Streams {
    async fn quiet(self: Arc<Self>, _: Context, _: Stream) {}

    async fn crash(self: Arc<Self>, _: Context, _: Stream) {
        panic!("stream boom");
    }

    async fn reject(self: Arc<Self>, mut ctx: Context, _: Stream) {
        ctx.error(StatusCode::BAD_REQUEST, "need to");
    }

    async fn twice(self: Arc<Self>, mut ctx: Context, mut stream: Stream) {
        let first = ctx.write_header(StatusCode::OK).is_ok();
        let second = ctx.write_header(StatusCode::CREATED).err().map(|e| e.0);
        let _ = stream.write(&(first && second == Some(StatusCode::OK))).await;
    }
}

fn streams() -> Router<Streams> {
    Router::new(Streams).unwrap()
}

#[tokio::test]
async fn streaming_panic_before_header_is_500() {
    let router = streams();
    let response = router.dispatch(get("/s/crash")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(text(response).await, "panic: stream boom\n");

    let response = router.dispatch(get("/s/quiet")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn streaming_return_without_header_is_empty_200() {
    let response = streams().dispatch(get("/s/quiet")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "");
}

#[tokio::test]
async fn streaming_error_before_header_answers_the_request() {
    let response = streams().dispatch(get("/s/reject")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(text(response).await, "need to\n");
}

#[tokio::test]
async fn streaming_header_is_written_once() {
    let mut response = streams().dispatch(get("/s/twice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(next_frame(&mut response).await.unwrap(), "true\n");
    assert_eq!(next_frame(&mut response).await, None);
}

// ── Routing ──────────────────────────────────────────────────────────────────

struct Chat {
    served: AtomicUsize,
}

impl Service for Chat {
    fn declare(d: &mut Declaration) {
        d.anchor(r#"prefix:"/chat""#)
            .processor("Special", r#"method:"GET" path:"/item/special""#)
            .processor("Item", r#"method:"GET" path:"/item/([^/]+)""#)
            .processor("Shadow", r#"method:"GET" path:"/shadow/([^/]+)""#)
            .processor("Shadowed", r#"method:"GET" path:"/shadow/exact""#)
            .processor("Conv", r#"method:"GET" path:"/conversation/(\\d+)""#)
            .processor("Latest", r#"method:"GET" path:"/latest""#)
            .processor("Page", r#"method:"GET" path:"/page/([^/]+)""#)
            .processor("Hello", r#"method:"GET" path:"/hello/([^/]+)/from/([^/]+)""#)
            .processor("Plain", r#"method:"GET" path:"/plain" mime:"text/plain""#)
            .processor("Made", r#"method:"POST" path:"/made""#)
            .processor("Ratio", r#"method:"GET" path:"/ratio""#);
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor("HandleSpecial", |_: Arc<Self>, _: Context, (): ()| async { "special" })
            .processor("HandleItem", |_: Arc<Self>, _: Context, (id,): (String,)| async move { format!("item {id}") })
            .processor("HandleShadow", |_: Arc<Self>, _: Context, (id,): (String,)| async move {
                format!("shadow {id}")
            })
            .processor("HandleShadowed", |_: Arc<Self>, _: Context, (): ()| async { "unreachable" })
            .processor("HandleConv", |svc: Arc<Self>, _: Context, (id,): (u64,)| async move {
                svc.served.fetch_add(1, Ordering::SeqCst);
                id
            })
            .processor("HandleLatest", |_: Arc<Self>, mut ctx: Context, (): ()| async move {
                match ctx.path_of("Conv", &[&7]) {
                    Ok(path) => ctx.redirect_to(&path),
                    Err(e) => ctx.error(StatusCode::INTERNAL_SERVER_ERROR, e),
                }
            })
            .processor("HandlePage", |_: Arc<Self>, _: Context, (n,): (u32,)| async move { n })
            .processor("HandleHello", |_: Arc<Self>, _: Context, (to, from): (String, String)| async move {
                format!("hello {to}, from {from}")
            })
            .processor("HandlePlain", |_: Arc<Self>, _: Context, (): ()| async { "just text" })
            .processor("HandleMade", |_: Arc<Self>, mut ctx: Context, (): ()| async move {
                let _ = ctx.write_header(StatusCode::CREATED);
                ctx.error(StatusCode::NOT_FOUND, "too late");
                "made"
            })
            .processor("HandleRatio", |_: Arc<Self>, _: Context, (): ()| async { f64::NAN });
    }
}

fn chat() -> Router<Chat> {
    Router::new(Chat { served: AtomicUsize::new(0) }).unwrap()
}

#[tokio::test]
async fn first_declared_match_wins() {
    let router = chat();

    let response = router.dispatch(get("/chat/item/special")).await;
    assert_eq!(text(response).await, "\"special\"\n");
    let response = router.dispatch(get("/chat/item/42")).await;
    assert_eq!(text(response).await, "\"item 42\"\n");

    // Declared broad-first, the narrow route never matches.
    let response = router.dispatch(get("/chat/shadow/exact")).await;
    assert_eq!(text(response).await, "\"shadow exact\"\n");
    assert_eq!(router.find(&Method::GET, "/chat/shadow/exact").unwrap().route.field, "Shadow");
}

#[test]
fn find_reports_captures() {
    let router = chat();
    let found = router.find(&Method::GET, "/chat/hello/rest/from/go").unwrap();
    assert_eq!(found.route.field, "Hello");
    assert_eq!(found.args, ["rest", "go"]);
    assert_eq!(found.vars["1"], "rest");
    assert_eq!(found.vars["2"], "go");

    assert!(router.find(&Method::POST, "/chat/latest").is_none());
}

#[tokio::test]
async fn positional_arguments_are_converted() {
    let router = chat();

    let response = router.dispatch(get("/chat/hello/rest/from/go")).await;
    assert_eq!(text(response).await, "\"hello rest, from go\"\n");

    let response = router.dispatch(get("/chat/conversation/12")).await;
    assert_eq!(text(response).await, "12\n");
    assert_eq!(router.service().served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unconvertible_argument_is_400() {
    let router = chat();
    let response = router.dispatch(get("/chat/page/abc")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text(response).await.contains("can't convert path argument 1"));
}

#[tokio::test]
async fn redirect_to_a_built_path() {
    let router = chat();
    assert_eq!(router.path("Conv", &[&7]).unwrap(), "/chat/conversation/7");

    let response = router.dispatch(get("/chat/latest")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[LOCATION], "/chat/conversation/7");
}

#[tokio::test]
async fn route_mime_picks_the_codec() {
    let router = chat();
    let response = router.dispatch(get("/chat/plain")).await;
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(text(response).await, "just text");
}

#[tokio::test]
async fn written_status_survives_a_later_error() {
    let response = chat().dispatch(request(Method::POST, "/chat/made", "")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(text(response).await, "\"made\"\n");
}

#[tokio::test]
async fn non_finite_reply_is_500_not_an_empty_body() {
    let response = chat().dispatch(get("/chat/ratio")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text(response).await.starts_with("can't marshal response: "));
}

// ── Construction failures ────────────────────────────────────────────────────

fn config_error<S: Service>(svc: S) -> ConfigError {
    match Router::new(svc) {
        Err(Error::Config(e)) => e,
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("router built from a broken declaration"),
    }
}

struct NoAnchor;

impl Service for NoAnchor {
    fn declare(d: &mut Declaration) {
        d.processor("CreateHello", r#"method:"POST" path:"/hello""#);
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor("HandleCreateHello", |_: Arc<Self>, _: Context, (): ()| async {});
    }
}

#[test]
fn missing_anchor_fails_construction() {
    assert!(matches!(config_error(NoAnchor), ConfigError::MissingAnchor { .. }));
}

struct Unresolved;

impl Service for Unresolved {
    fn declare(d: &mut Declaration) {
        d.anchor("").processor("GetHello", r#"method:"GET" path:"/hello" func:"Nope""#);
    }

    fn handlers(_: &mut Handlers<Self>) {}
}

#[test]
fn unresolved_handler_names_the_field() {
    let err = config_error(Unresolved);
    assert!(matches!(&err, ConfigError::UnresolvedHandler { handler, .. } if handler == "Nope"));
    assert!(err.to_string().contains("GetHello"));
}

struct WrongArity;

impl Service for WrongArity {
    fn declare(d: &mut Declaration) {
        d.anchor("").processor("Get", r#"method:"GET" path:"/a/([^/]+)/b/([^/]+)""#);
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor("HandleGet", |_: Arc<Self>, _: Context, (a,): (String,)| async move { a });
    }
}

#[test]
fn argument_count_must_match_slots() {
    let err = config_error(WrongArity);
    assert!(matches!(err, ConfigError::Arity { params: 1, captures: 2, .. }));
}

struct WrongKind;

impl Service for WrongKind {
    fn declare(d: &mut Declaration) {
        d.anchor("").streaming("Watch", r#"method:"GET" path:"/watch""#);
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor("HandleWatch", |_: Arc<Self>, _: Context, (): ()| async {});
    }
}

#[test]
fn streaming_field_needs_a_streaming_handler() {
    assert!(matches!(config_error(WrongKind), ConfigError::HandlerKind { .. }));
}

struct UnknownMime;

impl Service for UnknownMime {
    fn declare(d: &mut Declaration) {
        d.anchor(r#"mime:"application/x-yaml""#).processor("Get", r#"method:"GET" path:"/get""#);
    }

    fn handlers(h: &mut Handlers<Self>) {
        h.processor("HandleGet", |_: Arc<Self>, _: Context, (): ()| async {});
    }
}

#[test]
fn mime_without_a_codec_fails_unless_registered() {
    assert!(matches!(config_error(UnknownMime), ConfigError::UnknownMime { .. }));
    let router = Router::builder(UnknownMime)
        .marshaller("application/x-yaml", restive::Json)
        .build();
    assert!(router.is_ok());
}
