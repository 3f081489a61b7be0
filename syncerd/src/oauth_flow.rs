use std::collections::HashMap;
use std::time::Duration;

use gdrive_core::{DRIVE_SCOPE, OAuthClient, OAuthToken};
use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};
use url::Url;

const STATE_LEN: usize = 32;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OAuthFlowError {
    #[error("oauth error: {0}")]
    OAuth(#[from] gdrive_core::OAuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authorization code missing in redirect")]
    MissingCode,
    #[error("authorization was denied: {0}")]
    Denied(String),
    #[error("redirect carried a missing or unexpected state parameter")]
    StateMismatch,
    #[error("authorization timed out")]
    Timeout,
}

/// Browser consent with a one-shot loopback redirect listener.
pub struct OAuthFlow {
    client: OAuthClient,
    port: u16,
    timeout: Duration,
}

impl OAuthFlow {
    pub fn new(client: OAuthClient, port: u16, timeout: Duration) -> Self {
        Self {
            client,
            port,
            timeout,
        }
    }

    pub async fn authenticate(&self) -> Result<OAuthToken, OAuthFlowError> {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
        let state = random_state(&mut rand::thread_rng());
        let url = self
            .client
            .authorize_url(&redirect_uri, DRIVE_SCOPE, Some(&state));

        println!("Authorize access in your browser:\n{url}");
        if let Err(err) = open::that(url.as_str()) {
            warn!(error = %err, "failed to open browser, open the URL manually");
        }

        let code = receive_code(listener, self.timeout, &state).await?;
        info!("authorization code received");
        Ok(self.client.exchange_code(&code, &redirect_uri).await?)
    }
}

/// Unguessable value tying the redirect to the consent URL this flow opened.
fn random_state<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..STATE_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}

/// Accepts exactly one redirect on `listener` and requires it to carry
/// `expected_state`. The listener is consumed so the port is released on
/// every exit path.
pub async fn receive_code(
    listener: TcpListener,
    timeout: Duration,
    expected_state: &str,
) -> Result<String, OAuthFlowError> {
    let (mut stream, _) = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| OAuthFlowError::Timeout)??;
    drop(listener);

    let mut request = vec![0u8; 8192];
    let read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut request))
        .await
        .map_err(|_| OAuthFlowError::Timeout)??;
    let request_text = String::from_utf8_lossy(&request[..read]);
    let outcome = code_from_redirect(&request_text, expected_state);

    let response: &[u8] = match &outcome {
        Ok(_) => {
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n\
            <html><body><h2>Success!</h2><p>You can close this browser window.</p></body></html>"
        }
        Err(_) => {
            b"HTTP/1.1 400 Bad Request\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n\
            <html><body><h2>Authorization failed</h2><p>Return to the terminal for details.</p></body></html>"
        }
    };
    let _ = stream.write_all(response).await;
    let _ = stream.shutdown().await;

    outcome
}

fn code_from_redirect(request: &str, expected_state: &str) -> Result<String, OAuthFlowError> {
    let params = redirect_query(request).ok_or(OAuthFlowError::MissingCode)?;
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(OAuthFlowError::StateMismatch);
    }
    if let Some(error) = params.get("error") {
        return Err(OAuthFlowError::Denied(error.clone()));
    }
    params
        .get("code")
        .filter(|code| !code.is_empty())
        .cloned()
        .ok_or(OAuthFlowError::MissingCode)
}

fn redirect_query(request: &str) -> Option<HashMap<String, String>> {
    let request_line = request.lines().next()?;
    let target = request_line.split_whitespace().nth(1)?;
    let request_url = if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target).ok()?
    } else {
        Url::parse(&format!("http://127.0.0.1{target}")).ok()?
    };
    Some(request_url.query_pairs().into_owned().collect())
}
