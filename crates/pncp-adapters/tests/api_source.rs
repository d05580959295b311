use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use pncp_adapters::{ContractSource, PncpApiConfig, PncpApiSource, SourceError};
use pncp_core::SourceRecord;
use pncp_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Responder = fn(&str) -> (u16, String);

/// Serves every request with `respond(request_line)` and counts requests.
async fn serve(respond: Responder) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let text = String::from_utf8_lossy(&request);
                let line = text.lines().next().unwrap_or_default().to_string();
                let (status, body) = respond(&line);
                let response = format!(
                    "HTTP/1.1 {status} STUB\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}"), hits)
}

fn source(base_url: String, max_retries: usize) -> PncpApiSource {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: None,
        concurrency: 2,
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        },
        request_interval: None,
        use_system_proxy: false,
    })
    .unwrap();
    PncpApiSource::new(
        Arc::new(http),
        PncpApiConfig {
            base_url,
            modality_codes: vec![6],
            ..PncpApiConfig::default()
        },
    )
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 8, 16).unwrap()
}

#[tokio::test]
async fn exhausted_retries_leave_the_date_transient() {
    let (url, hits) = serve(|_| (503, String::new())).await;
    let err = source(url, 1).fetch_day(day()).await.unwrap_err();

    assert!(matches!(err, SourceError::Transient { date, .. } if date == day()));
    assert!(err.is_transient());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_requests_are_invalid_not_transient() {
    let (url, hits) = serve(|_| (422, r#"{"message": "data invalida"}"#.to_string())).await;
    let err = source(url, 3).fetch_day(day()).await.unwrap_err();

    assert!(matches!(err, SourceError::Invalid { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_page_is_fetched_and_kept_in_page_order() {
    let (url, hits) = serve(|line| {
        assert!(line.contains("dataInicial=20250816"));
        assert!(line.contains("codigoModalidadeContratacao=6"));
        let (id, page) = if line.contains("pagina=2") { ("B", 2) } else { ("A", 1) };
        let body = format!(
            r#"{{"data": [{{"numeroControlePNCP": "{id}", "objetoCompra": "fone"}}], "totalRegistros": 2, "totalPaginas": 2, "numeroPagina": {page}}}"#
        );
        (200, body)
    })
    .await;
    let records = source(url, 0).fetch_day(day()).await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let ids = records
        .iter()
        .map(|record| match record {
            SourceRecord::Known(record) => record.control_number.clone(),
            SourceRecord::Raw { problem, .. } => panic!("unexpected raw record: {problem}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["A", "B"]);
}
