use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use broker::{BrokerError, Dma20, DmaCalculator, Method, SessionManager};
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_futures::Instrument;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub processed: usize,
    pub historical: usize,
    pub fallback: usize,
    pub failures: usize,
}

#[instrument(
    name = "run_daily",
    skip(calculator, session, watchlist, cancel),
    fields(total_symbols = watchlist.len())
)]
pub async fn run_daily(
    calculator: Arc<DmaCalculator>,
    session: Arc<SessionManager>,
    watchlist: Vec<String>,
    concurrency: usize,
    pause: Duration,
    cancel: CancellationToken,
) -> Result<ScanSummary> {
    if !session.refresh_if_needed().await {
        bail!("no valid broker session, run `scanner login` first");
    }

    // Child token so an auth failure stops this scan without stopping the process.
    let scan = cancel.child_token();

    let mut tasks = stream::iter(watchlist.into_iter().enumerate())
        .map(|(i, symbol)| {
            let calculator = Arc::clone(&calculator);
            let scan = scan.clone();

            let span = tracing::info_span!("daily_symbol", symbol = %symbol);

            async move {
                if i > 0 {
                    tokio::select! {
                        _ = scan.cancelled() => return (symbol, Err(BrokerError::Cancelled)),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }

                let result = calculator.compute_dma20_with(&symbol, &scan).await;
                (symbol, result)
            }
            .instrument(span)
        })
        .buffer_unordered(concurrency.max(1));

    let mut summary = ScanSummary::default();
    let mut results: Vec<Dma20> = Vec::new();

    while let Some((symbol, res)) = tasks.next().await {
        summary.processed += 1;

        match res {
            Ok(dma) => {
                match dma.method {
                    Method::Historical => summary.historical += 1,
                    Method::Fallback => summary.fallback += 1,
                }
                info!(
                    symbol = %symbol,
                    dma20 = dma.value,
                    method = dma.method.as_str(),
                    current_price = dma.current_price,
                    sample_size = dma.sample_size,
                    "computed DMA20"
                );
                results.push(dma);
            }
            Err(BrokerError::Cancelled) => {
                debug!(symbol = %symbol, "skipped, scan cancelled");
            }
            Err(e) if e.is_auth() => {
                summary.failures += 1;
                error!(symbol = %symbol, error = %e, "session lost mid-scan, stopping");
                scan.cancel();
            }
            Err(e) => {
                summary.failures += 1;
                warn!(symbol = %symbol, error = %e, "DMA20 failed");
            }
        }
    }

    for (rank, dma) in rank_by_dma_distance(results).iter().enumerate() {
        info!(
            rank = rank + 1,
            symbol = %dma.symbol,
            percent_from_dma = dma.percent_from_dma(),
            method = dma.method.as_str(),
            "ranking"
        );
    }

    info!(
        processed = summary.processed,
        historical = summary.historical,
        fallback = summary.fallback,
        failures = summary.failures,
        "completed daily scan"
    );

    Ok(summary)
}

/// Most fallen below the average first.
pub fn rank_by_dma_distance(mut results: Vec<Dma20>) -> Vec<Dma20> {
    results.sort_by(|a, b| a.percent_from_dma().total_cmp(&b.percent_from_dma()));
    results
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Instant};

    use async_trait::async_trait;
    use broker::{
        BrokerConfig, HttpBody, HttpRequest, HttpResponse, PriceClient, SESSION_DURATION, Session,
        SessionStore, Transport,
    };
    use chrono::Utc;
    use serde_json::{Value, json};

    use super::*;

    const SESSION_CHECK: &str = "NSE:SESSION_CHECK-EQ";

    /// Answers from a fixed routing function and records what it was asked.
    struct Upstream {
        respond: fn(&HttpRequest) -> HttpResponse,
        calls: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl Transport for Upstream {
        async fn execute(&self, request: HttpRequest) -> broker::Result<HttpResponse> {
            let response = (self.respond)(&request);
            self.calls.lock().unwrap().push(request);
            Ok(response)
        }
    }

    fn scanner(
        dir: &tempfile::TempDir,
        respond: fn(&HttpRequest) -> HttpResponse,
    ) -> (Arc<DmaCalculator>, Arc<SessionManager>, Arc<Upstream>) {
        let config = BrokerConfig {
            type_a_base_url: "http://typea.test".into(),
            type_b_base_url: "http://typeb.test".into(),
            session_file: dir.path().join("session.json"),
            enable_type_b: false,
            probe_symbol: SESSION_CHECK.into(),
        };

        let now = Utc::now();
        SessionStore::new(config.session_file.clone())
            .save(&Session {
                username: Some("trader".into()),
                password: None,
                api_key: Some("key".into()),
                access_token: Some("acc".into()),
                expires_at: Some(now + SESSION_DURATION),
                saved_at: Some(now),
            })
            .unwrap();

        let upstream = Arc::new(Upstream {
            respond,
            calls: Mutex::new(Vec::new()),
        });
        let transport: Arc<dyn Transport> = upstream.clone();
        let session = Arc::new(SessionManager::new(config, Arc::clone(&transport)));
        let calculator = Arc::new(DmaCalculator::new(PriceClient::new(
            transport,
            Arc::clone(&session),
        )));

        (calculator, session, upstream)
    }

    fn ltp(request: &HttpRequest) -> Option<&str> {
        request
            .url
            .ends_with("instruments/quote/ltp")
            .then(|| request.query_value("i"))
            .flatten()
    }

    /// HIST has a full history, FALL only a live price, everything else is unknown.
    fn market(request: &HttpRequest) -> HttpResponse {
        if let Some(instrument) = ltp(request) {
            return match instrument {
                SESSION_CHECK => HttpResponse::new(200, "{}"),
                "NSE:HIST-EQ" | "NSE:FALL-EQ" => HttpResponse::new(
                    200,
                    json!({"status": "success", "data": {instrument: {"last_price": 100.0}}})
                        .to_string(),
                ),
                _ => HttpResponse::new(404, ""),
            };
        }

        let symbol = match &request.body {
            Some(HttpBody::Json(body)) => body["symbol"].as_str(),
            _ => None,
        };
        if request.url.ends_with("instruments/history") && symbol == Some("HIST-EQ") {
            let bars: Vec<Value> = (1..=25)
                .map(|day| {
                    json!({"date": format!("2025-07-{day:02}"), "close": 90.0 + f64::from(day)})
                })
                .collect();
            return HttpResponse::new(200, json!({"status": "success", "data": bars}).to_string());
        }

        HttpResponse::new(404, "")
    }

    fn rejects_after_session_check(request: &HttpRequest) -> HttpResponse {
        match ltp(request) {
            Some(SESSION_CHECK) => HttpResponse::new(200, "{}"),
            _ => HttpResponse::new(401, ""),
        }
    }

    fn rejects_everything(_: &HttpRequest) -> HttpResponse {
        HttpResponse::new(401, "")
    }

    fn watchlist(symbols: &[&str]) -> Vec<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn summary_counts_each_method_and_paces_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let (calculator, session, _) = scanner(&dir, market);
        let pause = Duration::from_millis(20);

        let started = Instant::now();
        let summary = run_daily(
            calculator,
            session,
            watchlist(&["HIST", "NSE:FALL", "MISS"]),
            1,
            pause,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(started.elapsed() >= pause * 2);
        assert_eq!(
            summary,
            ScanSummary {
                processed: 3,
                historical: 1,
                fallback: 1,
                failures: 1,
            }
        );
    }

    #[tokio::test]
    async fn auth_failure_cancels_the_rest_of_the_scan_only() {
        let dir = tempfile::tempdir().unwrap();
        let (calculator, session, upstream) = scanner(&dir, rejects_after_session_check);
        let process = CancellationToken::new();

        let summary = run_daily(
            calculator,
            Arc::clone(&session),
            watchlist(&["NSE:NIFTYBEES", "NSE:CPSEETF", "NSE:ITBEES"]),
            1,
            Duration::from_millis(10),
            process.clone(),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            ScanSummary {
                processed: 3,
                historical: 0,
                fallback: 0,
                failures: 1,
            }
        );
        assert!(!process.is_cancelled());
        // session check, then the first quote that was refused
        assert_eq!(upstream.calls.lock().unwrap().len(), 2);
        assert!(session.credentials().await.is_none());
    }

    #[tokio::test]
    async fn refuses_to_scan_without_a_valid_session() {
        let dir = tempfile::tempdir().unwrap();
        let (calculator, session, upstream) = scanner(&dir, rejects_everything);

        let result = run_daily(
            calculator,
            session,
            watchlist(&["NSE:NIFTYBEES"]),
            1,
            Duration::ZERO,
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(upstream.calls.lock().unwrap().len(), 1);
    }

    fn dma(symbol: &str, value: f64, current_price: f64) -> Dma20 {
        Dma20 {
            symbol: symbol.into(),
            value,
            method: Method::Historical,
            sample_size: 20,
            current_price,
        }
    }

    #[test]
    fn ranking_puts_the_deepest_discount_first() {
        let ranked = rank_by_dma_distance(vec![
            dma("NSE:NIFTYBEES", 100.0, 103.0),
            dma("NSE:ITBEES", 50.0, 45.0),
            dma("NSE:CPSEETF", 80.0, 79.0),
        ]);

        let order: Vec<&str> = ranked.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(order, ["NSE:ITBEES", "NSE:CPSEETF", "NSE:NIFTYBEES"]);
    }
}
