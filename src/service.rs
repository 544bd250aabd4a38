use crate::declaration::Declaration;
use crate::handler::Handlers;

/// A value whose routes are declared, not coded.
///
/// `declare` lists the service's fields in order: the anchor first, then its
/// routes and any plain state. `handlers` registers the functions those
/// routes bind to. Both run once, when a [`Router`](crate::Router) is built.
///
/// ```
/// use std::sync::Arc;
///
/// use restive::{Context, Declaration, Handlers, Router, Service};
///
/// struct Greeter;
///
/// impl Service for Greeter {
///     fn declare(d: &mut Declaration) {
///         d.anchor(r#"prefix:"/v1""#);
///         d.processor("Greet", r#"method:"GET" path:"/greet/(.*)""#);
///     }
///
///     fn handlers(h: &mut Handlers<Self>) {
///         h.processor("HandleGreet", |_: Arc<Self>, _: Context, (who,): (String,)| async move {
///             format!("hello, {who}")
///         });
///     }
/// }
///
/// let router = Router::new(Greeter).unwrap();
/// assert_eq!(router.path("Greet", &[&"rest"]).unwrap(), "/v1/greet/rest");
/// ```
pub trait Service: Send + Sync + Sized + 'static {
    fn declare(d: &mut Declaration);

    fn handlers(h: &mut Handlers<Self>);
}
