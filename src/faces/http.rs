//! Blocking ureq calls bridged onto the async runtime.

use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// Run a blocking HTTP exchange on the blocking pool, bounded by `timeout`
/// and abandoned as soon as `cancel` fires.
pub(crate) async fn call<T, F>(
    timeout: Duration,
    cancel: &CancellationToken,
    request: F,
) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }

    let handle = tokio::task::spawn_blocking(request);
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        joined = tokio::time::timeout(timeout, handle) => match joined {
            Err(_) => Err(ProviderError::Timeout),
            Ok(Err(e)) => Err(ProviderError::Transient(format!("request task failed: {e}"))),
            Ok(Ok(result)) => result,
        },
    }
}

/// Classify a ureq failure. 429 and 5xx are worth retrying, other statuses
/// are the caller's fault.
pub(crate) fn classify(err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let message = format!("HTTP {code}: {}", body.trim());
            if code == 429 || code >= 500 {
                ProviderError::Transient(message)
            } else {
                ProviderError::Permanent(message)
            }
        }
        ureq::Error::Transport(transport) => {
            let timed_out = std::error::Error::source(&transport)
                .and_then(|s| s.downcast_ref::<std::io::Error>())
                .is_some_and(|io| matches!(io.kind(), IoErrorKind::TimedOut | IoErrorKind::WouldBlock));
            if timed_out {
                ProviderError::Timeout
            } else {
                match transport.kind() {
                    ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
                        ProviderError::Permanent(transport.to_string())
                    }
                    _ => ProviderError::Transient(transport.to_string()),
                }
            }
        }
    }
}

/// Decode a JSON body, treating malformed payloads as permanent.
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(
    response: ureq::Response,
) -> Result<T, ProviderError> {
    response
        .into_json()
        .map_err(|e| ProviderError::Permanent(format!("invalid response body: {e}")))
}

/// Single-file `multipart/form-data` body.
pub(crate) fn multipart_file(field: &str, filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("pictor-{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_request_times_out() {
        let result: Result<(), _> = call(Duration::from_millis(20), &CancellationToken::new(), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert_eq!(result, Err(ProviderError::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = call(Duration::from_secs(1), &cancel, || Ok(1)).await;
        assert_eq!(result, Err(ProviderError::Cancelled));
    }

    #[test]
    fn test_multipart_layout() {
        let (content_type, body) = multipart_file("file", "face.jpg", b"JPEG");
        let boundary = content_type.split("boundary=").nth(1).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("name=\"file\"; filename=\"face.jpg\""));
        assert!(text.ends_with(&format!("\r\n\r\nJPEG\r\n--{boundary}--\r\n")));
    }
}
