use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use boa_engine::vm::RuntimeLimits;
use boa_engine::{Context, JsObject, JsString, JsValue, Source};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::builtins;
use crate::error::PacError;

const ENTRY_POINT: &str = "FindProxyForURL";
const LOOP_ITERATION_LIMIT: u64 = 1_000_000;
const RECURSION_LIMIT: usize = 256;
const CALL_BACKLOG: usize = 64;

/// A compiled PAC script bound to its interpreter context.
///
/// The context is neither `Send` nor reentrant, so a `Script` never leaves the thread
/// that compiled it.
struct Script {
    context: Context,
    entry: JsObject,
}

impl Script {
    fn compile(source: &[u8]) -> Result<Self, PacError> {
        let mut context = Context::default();

        let mut limits = RuntimeLimits::default();
        limits.set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
        limits.set_recursion_limit(RECURSION_LIMIT);
        context.set_runtime_limits(limits);

        builtins::register(&mut context)?;

        context
            .eval(Source::from_bytes(source))
            .map_err(|e| PacError::Compile(e.to_string()))?;

        let entry = context
            .global_object()
            .get(JsString::from(ENTRY_POINT), &mut context)
            .map_err(|e| PacError::Compile(e.to_string()))?;

        let entry = entry
            .as_callable()
            .cloned()
            .ok_or(PacError::MissingEntryPoint)?;

        Ok(Self { context, entry })
    }

    fn find_proxy(&mut self, url: &str, host: &str) -> Result<Option<String>, PacError> {
        let args = [
            JsValue::from(JsString::from(url)),
            JsValue::from(JsString::from(host)),
        ];

        let value = self
            .entry
            .call(&JsValue::undefined(), &args, &mut self.context)
            .map_err(|e| PacError::Evaluation(e.to_string()))?;

        if value.is_null_or_undefined() {
            return Ok(None);
        }

        let value = value
            .to_string(&mut self.context)
            .map_err(|e| PacError::Evaluation(e.to_string()))?;

        Ok(Some(value.to_std_string_escaped()))
    }
}

struct Call {
    url: String,
    host: String,
    reply: oneshot::Sender<Result<Option<String>, PacError>>,
}

/// Handle to a PAC script running on its own interpreter thread.
///
/// Calls are queued and evaluated one at a time, in arrival order. Dropping every handle
/// stops the thread.
#[derive(Clone)]
pub struct PacEngine {
    calls: mpsc::Sender<Call>,
}

impl PacEngine {
    /// Compiles `source` and looks up `FindProxyForURL`.
    pub async fn compile(source: Vec<u8>) -> Result<Self, PacError> {
        let (calls, requests) = mpsc::channel(CALL_BACKLOG);
        let (ready, compiled) = oneshot::channel();

        thread::Builder::new()
            .name("pac-engine".to_string())
            .spawn(move || run(source, requests, ready))?;

        compiled.await.map_err(|_| PacError::EngineUnavailable)??;
        Ok(Self { calls })
    }

    /// Evaluates `FindProxyForURL(url, host)`. `None` stands for a null or undefined result.
    pub async fn find_proxy(&self, url: &str, host: &str) -> Result<Option<String>, PacError> {
        let (reply, response) = oneshot::channel();
        let call = Call {
            url: url.to_string(),
            host: host.to_string(),
            reply,
        };

        self.calls
            .send(call)
            .await
            .map_err(|_| PacError::EngineUnavailable)?;

        response.await.map_err(|_| PacError::EngineUnavailable)?
    }
}

fn run(
    source: Vec<u8>,
    mut requests: mpsc::Receiver<Call>,
    ready: oneshot::Sender<Result<(), PacError>>,
) {
    let mut script = match Script::compile(&source) {
        Ok(script) => script,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Some(call) = requests.blocking_recv() {
        let result = catch_unwind(AssertUnwindSafe(|| script.find_proxy(&call.url, &call.host)))
            .unwrap_or_else(|_| {
                warn!(url = %call.url, "panic while evaluating pac script");
                Err(PacError::Evaluation("interpreter panicked".to_string()))
            });

        debug!(url = %call.url, host = %call.host, result = ?result, "evaluated pac script");
        let _ = call.reply.send(result);
    }

    debug!("pac engine stopped");
}

#[cfg(test)]
mod engine_tests {
    use super::*;

    async fn compile(source: &str) -> Result<PacEngine, PacError> {
        PacEngine::compile(source.as_bytes().to_vec()).await
    }

    #[tokio::test]
    async fn test_company_pac_file() {
        let engine = compile(
            r#"
            function FindProxyForURL(url, host)
            {
                if (isPlainHostName(host) || dnsDomainIs(host, ".company.com"))
                    return "DIRECT";
                else
                    return "PROXY myproxy.company.com:8080; DIRECT";
            }
        "#,
        )
        .await
        .unwrap();

        let intranet = engine.find_proxy("http://wiki", "wiki").await.unwrap();
        assert_eq!(intranet.as_deref(), Some("DIRECT"));

        let internal = engine
            .find_proxy("https://www.company.com", "www.company.com")
            .await
            .unwrap();
        assert_eq!(internal.as_deref(), Some("DIRECT"));

        let public = engine
            .find_proxy("https://www.mozilla.org", "www.mozilla.org")
            .await
            .unwrap();
        assert_eq!(
            public.as_deref(),
            Some("PROXY myproxy.company.com:8080; DIRECT")
        );
    }

    #[tokio::test]
    async fn test_url_protocol_conditions() {
        let engine = compile(
            r#"
            function FindProxyForURL(url, host) {
                if (isInNet(host, "10.0.1.0", "255.255.255.0")) {
                    return "DIRECT";
                } else if (url.substring(0, 5) == "http:") {
                    return "PROXY 10.0.1.1:3128";
                } else if (url.substring(0, 6) == "https:") {
                    return "PROXY 10.0.1.2:3128";
                }
                return "DIRECT";
            }
        "#,
        )
        .await
        .unwrap();

        let inside = engine.find_proxy("http://10.0.1.7", "10.0.1.7").await.unwrap();
        assert_eq!(inside.as_deref(), Some("DIRECT"));

        let http = engine.find_proxy("http://10.9.9.9", "10.9.9.9").await.unwrap();
        assert_eq!(http.as_deref(), Some("PROXY 10.0.1.1:3128"));

        let https = engine.find_proxy("https://10.9.9.9", "10.9.9.9").await.unwrap();
        assert_eq!(https.as_deref(), Some("PROXY 10.0.1.2:3128"));
    }

    #[tokio::test]
    async fn test_null_and_undefined_results() {
        let engine = compile("function FindProxyForURL(url, host) { return null; }")
            .await
            .unwrap();
        assert_eq!(engine.find_proxy("http://a", "a").await.unwrap(), None);

        let engine = compile("function FindProxyForURL(url, host) { }")
            .await
            .unwrap();
        assert_eq!(engine.find_proxy("http://a", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_syntax_error_fails_compilation() {
        let result = compile("function FindProxyForURL(url, host) { return ").await;
        assert!(matches!(result, Err(PacError::Compile(_))));
    }

    #[tokio::test]
    async fn test_throwing_top_level_fails_compilation() {
        let result = compile("throw new Error('broken');").await;
        assert!(matches!(result, Err(PacError::Compile(_))));
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let result = compile("function findProxy(url, host) { return 'DIRECT'; }").await;
        assert!(matches!(result, Err(PacError::MissingEntryPoint)));

        let result = compile("var FindProxyForURL = 'DIRECT';").await;
        assert!(matches!(result, Err(PacError::MissingEntryPoint)));
    }

    #[tokio::test]
    async fn test_runtime_errors_do_not_stop_the_engine() {
        let engine = compile(
            r#"
            function FindProxyForURL(url, host) {
                if (host == "boom") throw new Error("boom");
                if (host == "spin") { while (true) {} }
                return "DIRECT";
            }
        "#,
        )
        .await
        .unwrap();

        assert!(matches!(
            engine.find_proxy("http://boom", "boom").await,
            Err(PacError::Evaluation(_))
        ));
        assert!(matches!(
            engine.find_proxy("http://spin", "spin").await,
            Err(PacError::Evaluation(_))
        ));

        let ok = engine.find_proxy("http://fine", "fine").await.unwrap();
        assert_eq!(ok.as_deref(), Some("DIRECT"));
    }

    #[tokio::test]
    async fn test_time_predicates_do_not_match() {
        let engine = compile(
            r#"
            function FindProxyForURL(url, host) {
                if (weekdayRange("MON", "FRI")) return "PROXY office.example:3128";
                return "DIRECT";
            }
        "#,
        )
        .await
        .unwrap();

        let result = engine.find_proxy("http://a", "a").await.unwrap();
        assert_eq!(result.as_deref(), Some("DIRECT"));
    }
}
