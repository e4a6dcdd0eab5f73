//! Scripted in-memory registry replicas for unit tests

use async_trait::async_trait;
use registry_core::TransportError;
use reqwest::Method;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{HttpBackend, HttpRequest, HttpResponse};

pub(crate) type Reply = Result<HttpResponse, TransportError>;

struct Rule {
    method: Method,
    url_prefix: String,
    replies: VecDeque<Reply>,
    delay: Duration,
}

/// Replies from per-(method, URL prefix) queues and records every request.
///
/// A queue's last reply is sticky; earlier replies are consumed in order.
/// When several prefixes match, the longest wins. A rule may hold its reply
/// back for a delay, modelling a replica that is slow to answer.
pub(crate) struct ScriptedBackend {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue `reply` for requests matching `method` and `url_prefix`
    pub(crate) fn on(&self, method: Method, url_prefix: &str, reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        match rules
            .iter_mut()
            .find(|rule| rule.method == method && rule.url_prefix == url_prefix)
        {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                method,
                url_prefix: url_prefix.to_string(),
                replies: VecDeque::from([reply]),
                delay: Duration::ZERO,
            }),
        }
    }

    /// Drop whatever was queued for the key and answer with `reply` from now on
    pub(crate) fn replace(&self, method: Method, url_prefix: &str, reply: Reply) {
        self.rules
            .lock()
            .unwrap()
            .retain(|rule| !(rule.method == method && rule.url_prefix == url_prefix));
        self.on(method, url_prefix, reply);
    }

    /// Hold back replies for the key by `delay`; the request counts as sent at once
    pub(crate) fn delay(&self, method: Method, url_prefix: &str, delay: Duration) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules
            .iter_mut()
            .find(|rule| rule.method == method && rule.url_prefix == url_prefix)
        {
            rule.delay = delay;
        }
    }

    pub(crate) fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, method: Method) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method)
            .count()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn send(&self, request: HttpRequest, _timeout: Duration) -> Reply {
        self.calls.lock().unwrap().push(request.clone());

        let (reply, delay) = {
            let mut rules = self.rules.lock().unwrap();
            let rule = rules
                .iter_mut()
                .filter(|rule| rule.method == request.method && request.url.starts_with(&rule.url_prefix))
                .max_by_key(|rule| rule.url_prefix.len());

            match rule {
                Some(rule) if rule.replies.len() > 1 => (rule.replies.pop_front().unwrap(), rule.delay),
                Some(rule) => (rule.replies.front().cloned().unwrap(), rule.delay),
                None => (
                    Err(TransportError::Connect {
                        url: request.url,
                        message: "no scripted reply".to_string(),
                    }),
                    Duration::ZERO,
                ),
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

pub(crate) fn status(code: u16) -> Reply {
    Ok(HttpResponse::new(code))
}

pub(crate) fn json_reply(value: serde_json::Value) -> Reply {
    Ok(HttpResponse {
        status: 200,
        body: serde_json::to_vec(&value).unwrap(),
    })
}

pub(crate) fn timeout(url: &str) -> Reply {
    Err(TransportError::Timeout { url: url.to_string() })
}

pub(crate) fn connect_error(url: &str) -> Reply {
    Err(TransportError::Connect {
        url: url.to_string(),
        message: "connection refused".to_string(),
    })
}
