//! Host functions exposed to PAC scripts.
//!
//! See <https://developer.mozilla.org/en-US/docs/Web/HTTP/Guides/Proxy_servers_and_tunneling/Proxy_Auto-Configuration_PAC_file>
//! for the contract of every function.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};

use boa_engine::{Context, JsArgs, JsResult, JsString, JsValue, NativeFunction};
use glob::Pattern;
use tracing::{debug, info, warn};

use crate::error::PacError;

type Builtin = fn(&[JsValue], &mut Context) -> JsResult<JsValue>;

const BUILTINS: [(&str, usize, Builtin); 14] = [
    ("isPlainHostName", 1, js_is_plain_host_name),
    ("dnsDomainIs", 2, js_dns_domain_is),
    ("localHostOrDomainIs", 2, js_local_host_or_domain_is),
    ("isResolvable", 1, js_is_resolvable),
    ("isInNet", 3, js_is_in_net),
    ("dnsResolve", 1, js_dns_resolve),
    ("convert_addr", 1, js_convert_addr),
    ("myIpAddress", 0, js_my_ip_address),
    ("dnsDomainLevels", 1, js_dns_domain_levels),
    ("shExpMatch", 2, js_sh_exp_match),
    ("alert", 1, js_alert),
    // Time based predicates are not supported and always evaluate to undefined.
    ("weekdayRange", 3, js_unsupported),
    ("dateRange", 7, js_unsupported),
    ("timeRange", 7, js_unsupported),
];

/// Registers every builtin in the global scope of `context`.
pub(crate) fn register(context: &mut Context) -> Result<(), PacError> {
    for (name, length, builtin) in BUILTINS {
        let function = NativeFunction::from_copy_closure(move |_this, args, context| {
            Ok(call_guarded(name, builtin, args, context))
        });

        context
            .register_global_callable(JsString::from(name), length, function)
            .map_err(|e| PacError::Compile(format!("could not declare {}: {}", name, e)))?;
    }

    Ok(())
}

/// Invokes a builtin, turning thrown errors and panics into `undefined`.
fn call_guarded(name: &str, builtin: Builtin, args: &[JsValue], context: &mut Context) -> JsValue {
    match catch_unwind(AssertUnwindSafe(|| builtin(args, context))) {
        Ok(Ok(value)) => {
            debug!(builtin = name, args = args.len(), value = %value.display(), "called function");
            value
        }
        Ok(Err(err)) => {
            warn!(builtin = name, error = %err, "error while calling function");
            JsValue::undefined()
        }
        Err(_) => {
            warn!(builtin = name, "panic while calling function");
            JsValue::undefined()
        }
    }
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn js_string(value: &str) -> JsValue {
    JsValue::from(JsString::from(value))
}

fn js_is_plain_host_name(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::from(is_plain_host_name(&host)))
}

fn js_dns_domain_is(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let domain = string_arg(args, 1, context)?;
    Ok(JsValue::from(dns_domain_is(&host, &domain)))
}

fn js_local_host_or_domain_is(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let host_dom = string_arg(args, 1, context)?;
    Ok(JsValue::from(local_host_or_domain_is(&host, &host_dom)))
}

fn js_is_resolvable(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::from(is_resolvable(&host)))
}

fn js_is_in_net(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    let mask = string_arg(args, 2, context)?;
    Ok(JsValue::from(is_in_net(&host, &pattern, &mask)))
}

fn js_dns_resolve(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(js_string(&dns_resolve(&host)))
}

fn js_convert_addr(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let ip = string_arg(args, 0, context)?;
    Ok(JsValue::from(f64::from(convert_addr(&ip))))
}

fn js_my_ip_address(_args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(js_string(my_ip_address()))
}

fn js_dns_domain_levels(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::from(f64::from(dns_domain_levels(&host))))
}

fn js_sh_exp_match(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let value = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    Ok(JsValue::from(sh_exp_match(&value, &pattern)))
}

fn js_alert(args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let message = string_arg(args, 0, context)?;
    alert(&message);
    Ok(JsValue::undefined())
}

fn js_unsupported(_args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::undefined())
}

pub fn is_plain_host_name(host: &str) -> bool {
    !host.contains('.')
}

pub fn dns_domain_is(host: &str, domain: &str) -> bool {
    domain.starts_with('.') && host.ends_with(domain)
}

pub fn local_host_or_domain_is(host: &str, host_dom: &str) -> bool {
    if is_plain_host_name(host) {
        return host_dom.starts_with(&format!("{}.", host));
    }

    host == host_dom
}

pub fn is_resolvable(host: &str) -> bool {
    !dns_resolve(host).is_empty()
}

pub fn is_in_net(host: &str, pattern: &str, mask: &str) -> bool {
    let (Some(addr), Ok(pattern), Ok(mask)) = (
        resolve_ipv4(host),
        pattern.parse::<Ipv4Addr>(),
        mask.parse::<Ipv4Addr>(),
    ) else {
        return false;
    };

    let mask = u32::from(mask);
    u32::from(addr) & mask == u32::from(pattern) & mask
}

/// Best effort IPv4 lookup; empty when the host does not resolve.
pub fn dns_resolve(host: &str) -> String {
    resolve_ipv4(host)
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if host.is_empty() {
        return None;
    }

    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Some(addr);
    }

    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

/// Big-endian value of an IPv4 literal, or 0 when `ip` is not one.
pub fn convert_addr(ip: &str) -> u32 {
    ip.parse::<Ipv4Addr>().map(u32::from).unwrap_or(0)
}

pub fn my_ip_address() -> &'static str {
    "127.0.0.1"
}

pub fn dns_domain_levels(host: &str) -> u32 {
    host.matches('.').count() as u32
}

pub fn sh_exp_match(value: &str, pattern: &str) -> bool {
    Pattern::new(pattern)
        .map(|pattern| pattern.matches(value))
        .unwrap_or(false)
}

pub fn alert(message: &str) {
    info!(message, "pac alert");
}
