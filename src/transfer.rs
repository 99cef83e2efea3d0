use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};

use crate::cancel::CancelToken;
use crate::error::PackError;
use crate::plan::DownloadItem;

const CHUNK_SIZE: usize = 256 * 1024;
const BACKOFF_CEILING: Duration = Duration::from_secs(60);
const ERROR_SNIPPET_BYTES: usize = 500;

/// Failure classification that drives the retry policy. Only
/// `TransientNetwork` is worth waiting for; a mismatched content type or a
/// non-retryable status will not change on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientNetwork,
    ContentMismatch,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::TransientNetwork => write!(f, "transient-network"),
            ErrorClass::ContentMismatch => write!(f, "content-mismatch"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Result of one full attempt sequence for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Downloaded {
        bytes: u64,
    },
    /// The server answered with an empty body for a vector layer. Upstream
    /// publishes such layers when a district has no mapped subunits; the item
    /// keeps its manifest row but no file is produced.
    NoData,
    Cancelled,
    Failed {
        class: ErrorClass,
        message: String,
        attempts: u32,
    },
}

impl TransferOutcome {
    /// Text recorded in the item's `last_error` column. `None` means a clean
    /// download.
    pub fn error_text(&self) -> Option<String> {
        match self {
            TransferOutcome::Downloaded { .. } => None,
            TransferOutcome::NoData => Some("no data (empty response body)".to_string()),
            TransferOutcome::Cancelled => Some("cancelled".to_string()),
            TransferOutcome::Failed {
                class,
                message,
                attempts,
            } => Some(format!("{class} after {attempts} attempt(s): {message}")),
        }
    }
}

pub trait TransferClient: Send + Sync {
    fn fetch(&self, item: &DownloadItem, cancel: &CancelToken) -> TransferOutcome;
}

pub struct HttpTransferClient {
    client: Client,
    max_attempts: u32,
    base_backoff: Duration,
}

impl HttpTransferClient {
    pub fn new(
        timeout: Duration,
        verify_tls: bool,
        max_attempts: u32,
        base_backoff: Duration,
    ) -> Result<Self, PackError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ows-fieldpack/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PackError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| PackError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            max_attempts: max_attempts.max(1),
            base_backoff,
        })
    }

    fn attempt(
        &self,
        item: &DownloadItem,
        part: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<AttemptEnd, (ErrorClass, String)> {
        if let Some(parent) = item.out_path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| (ErrorClass::Permanent, format!("create dir: {err}")))?;
        }

        let mut response = self
            .client
            .get(&item.url)
            .send()
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let class = if is_retryable_status(status.as_u16()) {
                ErrorClass::TransientNetwork
            } else {
                ErrorClass::Permanent
            };
            return Err((class, format!("HTTP {status}")));
        }

        // Guard binary destinations before touching the body: a markup
        // content type here is an error page, and saving it as imagery data
        // is worse than saving nothing.
        if item.kind.expects_binary() {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string();
            if is_markup_content_type(&content_type) {
                let snippet = read_snippet(&mut response);
                return Err((
                    ErrorClass::ContentMismatch,
                    format!("unexpected content type `{content_type}` for binary payload :: {snippet}"),
                ));
            }
        }

        let mut file = File::create(part.as_std_path())
            .map_err(|err| (ErrorClass::Permanent, format!("create {part}: {err}")))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(AttemptEnd::Cancelled);
            }
            let n = response
                .read(&mut buf)
                .map_err(|err| (ErrorClass::TransientNetwork, format!("read body: {err}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|err| (ErrorClass::Permanent, format!("write {part}: {err}")))?;
            total += n as u64;
        }
        drop(file);

        if total == 0 {
            remove_if_exists(part);
            // Empty vector layers are published upstream for districts with
            // no mapped subunits; an empty binary payload is a server fault.
            if item.kind.expects_binary() {
                return Err((
                    ErrorClass::Permanent,
                    "empty response body for binary payload".to_string(),
                ));
            }
            return Ok(AttemptEnd::Empty);
        }

        // Atomic publish: a file at out_path is either absent or complete.
        fs::rename(part.as_std_path(), item.out_path.as_std_path())
            .map_err(|err| (ErrorClass::Permanent, format!("rename onto {}: {err}", item.out_path)))?;
        Ok(AttemptEnd::Complete(total))
    }
}

enum AttemptEnd {
    Complete(u64),
    Empty,
    Cancelled,
}

impl TransferClient for HttpTransferClient {
    fn fetch(&self, item: &DownloadItem, cancel: &CancelToken) -> TransferOutcome {
        let part = part_path(&item.out_path);
        let mut last: Option<(ErrorClass, String)> = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                remove_if_exists(&part);
                return TransferOutcome::Cancelled;
            }
            match self.attempt(item, &part, cancel) {
                Ok(AttemptEnd::Complete(bytes)) => {
                    return TransferOutcome::Downloaded { bytes };
                }
                Ok(AttemptEnd::Empty) => return TransferOutcome::NoData,
                Ok(AttemptEnd::Cancelled) => {
                    remove_if_exists(&part);
                    return TransferOutcome::Cancelled;
                }
                Err((class, message)) => {
                    remove_if_exists(&part);
                    tracing::debug!(
                        name = %item.name,
                        attempt,
                        %class,
                        %message,
                        "transfer attempt failed"
                    );
                    if class != ErrorClass::TransientNetwork {
                        return TransferOutcome::Failed {
                            class,
                            message,
                            attempts: attempt,
                        };
                    }
                    last = Some((class, message));
                    if attempt < self.max_attempts {
                        thread::sleep(backoff_delay(attempt, self.base_backoff));
                    }
                }
            }
        }

        let (class, message) =
            last.unwrap_or((ErrorClass::Permanent, "no attempt recorded".to_string()));
        TransferOutcome::Failed {
            class,
            message,
            attempts: self.max_attempts,
        }
    }
}

/// Temporary sibling of the destination; renamed onto it only on full
/// completion.
pub fn part_path(out_path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{out_path}.part"))
}

/// Exponential backoff `base * 2^(attempt-1)`, capped at 60 seconds.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.checked_mul(1u32 << exp)
        .map_or(BACKOFF_CEILING, |delay| delay.min(BACKOFF_CEILING))
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// A textual or markup content type where binary imagery was requested means
/// the server sent an error document.
pub fn is_markup_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("xml") || ct.contains("html") || ct.starts_with("text/")
}

fn classify_request_error(err: reqwest::Error) -> (ErrorClass, String) {
    // Only waiting-class failures are worth a retry; a request that could
    // not even be constructed will fail identically every time.
    let class = if err.is_timeout() || err.is_connect() {
        ErrorClass::TransientNetwork
    } else {
        ErrorClass::Permanent
    };
    (class, err.to_string())
}

fn read_snippet(response: &mut reqwest::blocking::Response) -> String {
    let mut buf = vec![0u8; ERROR_SNIPPET_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        match response.read(&mut buf[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    String::from_utf8_lossy(&buf[..filled]).replace('\n', " ")
}

fn remove_if_exists(path: &Utf8Path) {
    if path.as_std_path().exists() {
        let _ = fs::remove_file(path.as_std_path());
    }
}
