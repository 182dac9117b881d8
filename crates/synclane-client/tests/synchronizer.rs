use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use synclane_client::{
    CancellationToken, FinderOutput, PageParams, PageRequest, PageResponse, RequestError,
    Synchronizer, SynchronizerOptions,
};
use synclane_events::{CancelReason, ClientEvent, EventBus};
use synclane_telemetry::Metrics;
use synclane_test_support::assert::{eventually, wait_for};
use synclane_test_support::fixtures::{client, ok, unauthorized};
use synclane_test_support::mocks::ScriptedTransport;
use tokio::sync::Semaphore;

const SETTLE: Duration = Duration::from_secs(2);

type Finding = Result<FinderOutput<u32>, RequestError>;

fn options(limit: u32) -> SynchronizerOptions {
    SynchronizerOptions {
        limit,
        next_page_enabled: true,
    }
}

fn slice(records: &[u32], offset: u64, limit: u32) -> Vec<u32> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(records.len());
    let end = start.saturating_add(limit as usize).min(records.len());
    records[start..end].to_vec()
}

/// Pages over `0..total`, recording every requested offset.
fn paged(total: u32, offsets: Arc<Mutex<Vec<u64>>>) -> Synchronizer<u32> {
    let records: Vec<u32> = (0..total).collect();
    Synchronizer::new(
        move |request: PageRequest<u32>| {
            offsets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.offset);
            let page = slice(&records, request.offset, request.limit);
            async move {
                Ok::<_, RequestError>(FinderOutput::Page(
                    PageResponse::new(page).with_total(u64::from(total)),
                ))
            }
        },
        options(3),
    )
}

#[tokio::test]
async fn reset_cancels_every_pending_load() -> anyhow::Result<()> {
    let tokens: Arc<Mutex<Vec<CancellationToken>>> = Arc::default();
    let hang = Arc::new(AtomicBool::new(true));
    let events = EventBus::new();
    let metrics = Metrics::new()?;
    let mut stream = events.subscribe(None);

    let sync = {
        let tokens = Arc::clone(&tokens);
        let hang = Arc::clone(&hang);
        Synchronizer::builder(
            move |request: PageRequest<u32>| {
                tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(request.cancellation().clone());
                let hang = hang.load(Ordering::SeqCst);
                async move {
                    if hang {
                        std::future::pending::<()>().await;
                    }
                    Ok::<_, RequestError>(FinderOutput::Records(vec![1, 2]))
                }
            },
            options(10),
        )
        .events(events.clone())
        .metrics(metrics.clone())
        .build()
    };

    let loads: Vec<_> = (0..3_u64)
        .map(|offset| {
            let sync = sync.clone();
            tokio::spawn(async move {
                sync.load(PageParams {
                    offset: Some(offset * 10),
                    is_loading_next_page: true,
                    ..PageParams::default()
                })
                .await
            })
        })
        .collect();
    eventually(SETTLE, || sync.pending_requests() == 3).await?;

    assert_eq!(sync.reset(), 3);
    for load in loads {
        assert_eq!(load.await?, Err(RequestError::Cancelled));
    }
    let captured: Vec<CancellationToken> = tokens
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    assert!(captured.iter().all(CancellationToken::is_cancelled));
    assert_eq!(sync.pending_requests(), 0);
    assert!(!sync.snapshot().loading);
    assert_eq!(
        stream.next().await.map(|envelope| envelope.event),
        Some(ClientEvent::RequestsCancelled {
            count: 3,
            reason: CancelReason::SynchronizerReset,
        })
    );
    assert_eq!(metrics.cancelled_count("synchronizer_reset"), 3);

    hang.store(false, Ordering::SeqCst);
    sync.load(PageParams::default()).await?;
    let latest = tokens
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .last()
        .cloned();
    assert!(latest.is_some_and(|token| !token.is_cancelled()));
    assert_eq!(sync.snapshot().all_page_records, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn stale_data_is_shown_until_the_fresh_page_lands() -> anyhow::Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let sync: Synchronizer<String> = {
        let gate = Arc::clone(&gate);
        Synchronizer::new(
            move |request: PageRequest<String>| {
                let gate = Arc::clone(&gate);
                async move {
                    let stale = request.stale_while_revalidate();
                    assert!(stale.write(PageResponse::new(vec!["cached".to_string()]).with_total(1)));
                    let _permit = gate.acquire().await.map_err(|_| RequestError::Cancelled)?;
                    Ok::<_, RequestError>(FinderOutput::Page(
                        PageResponse::new(vec!["fresh-a".to_string(), "fresh-b".to_string()])
                            .with_total(2),
                    ))
                }
            },
            options(10),
        )
    };
    let mut observer = sync.subscribe();

    let load = tokio::spawn({
        let sync = sync.clone();
        async move { sync.load(PageParams::default()).await }
    });
    let provisional = wait_for(&mut observer, SETTLE, |snapshot| {
        snapshot.all_page_records == vec!["cached".to_string()]
    })
    .await?;
    assert!(provisional.loading);
    assert!(!provisional.loaded);
    assert_eq!(provisional.records_total_count, Some(1));

    gate.add_permits(1);
    load.await??;

    let settled = sync.snapshot();
    assert_eq!(settled.all_page_records, vec!["fresh-a", "fresh-b"]);
    assert!(!settled.loading);
    assert!(settled.loaded);
    assert!(!settled.has_next_page);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn incremental_pages_assemble_in_key_order() -> anyhow::Result<()> {
    let records: Vec<u32> = (0..9).collect();
    let sync = Synchronizer::new(
        move |request: PageRequest<u32>| {
            let page = slice(&records, request.offset, request.limit);
            let delay = match request.offset {
                3 => Duration::from_millis(50),
                6 => Duration::from_millis(10),
                _ => Duration::from_millis(1),
            };
            async move {
                tokio::time::sleep(delay).await;
                Ok::<_, RequestError>(FinderOutput::Page(PageResponse::new(page).with_total(9)))
            }
        },
        options(3),
    );

    sync.load(PageParams::default()).await?;
    assert!(sync.snapshot().has_next_page);

    let next = |offset| PageParams {
        offset: Some(offset),
        is_loading_next_page: true,
        ..PageParams::default()
    };
    let (slow, fast) = tokio::join!(sync.load(next(3)), sync.load(next(6)));
    slow?;
    fast?;

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.all_page_records, (0..9).collect::<Vec<_>>());
    assert_eq!(snapshot.records_total_count, Some(9));
    assert!(!snapshot.has_next_page);
    assert!(!snapshot.loading_next_page);
    assert_eq!(sync.pages().len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn superseded_results_are_discarded() -> anyhow::Result<()> {
    let sync: Synchronizer<String> = Synchronizer::new(
        |request: PageRequest<String>| {
            let term = request.search_term.clone().unwrap_or_default();
            let delay = if term == "slow" { 50 } else { 5 };
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, RequestError>(FinderOutput::Records(vec![term]))
            }
        },
        options(10),
    );

    let search = |term: &str| PageParams {
        search_term: Some(term.to_string()),
        ..PageParams::default()
    };
    let (stale, current) = tokio::join!(sync.load(search("slow")), sync.load(search("fast")));

    assert_eq!(stale, Err(RequestError::Cancelled));
    assert_eq!(current, Ok(()));
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.all_page_records, vec!["fast".to_string()]);
    assert_eq!(snapshot.search_term.as_deref(), Some("fast"));
    assert!(!snapshot.loading);
    Ok(())
}

#[tokio::test]
async fn polling_failure_keeps_the_previous_records() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let sync = {
        let calls = Arc::clone(&calls);
        Synchronizer::new(
            move |_request: PageRequest<u32>| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let finding: Finding = if call == 0 {
                        Ok(FinderOutput::Records(vec![1, 2]))
                    } else {
                        Err(RequestError::Api {
                            status: 503,
                            message: "Service unavailable".into(),
                        })
                    };
                    finding
                }
            },
            options(10),
        )
    };

    sync.load(PageParams::default()).await?;
    let polled = sync.refresh(true).await;

    assert!(polled.is_err());
    let after_poll = sync.snapshot();
    assert_eq!(after_poll.all_page_records, vec![1, 2]);
    assert_eq!(after_poll.error_message, None);
    assert!(after_poll.loaded);

    let foreground = sync.refresh(false).await;
    assert!(foreground.is_err());
    let after_foreground = sync.snapshot();
    assert!(after_foreground.all_page_records.is_empty());
    assert_eq!(
        after_foreground.error_message.as_deref(),
        Some("Service unavailable")
    );
    Ok(())
}

#[tokio::test]
async fn next_page_walks_offsets_until_the_total() -> anyhow::Result<()> {
    let offsets: Arc<Mutex<Vec<u64>>> = Arc::default();
    let sync = paged(7, Arc::clone(&offsets));

    sync.load(PageParams::default()).await?;
    assert!(sync.load_next_page().await?);
    assert!(sync.load_next_page().await?);
    assert!(!sync.load_next_page().await?);

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.all_page_records, (0..7).collect::<Vec<_>>());
    assert!(!snapshot.has_next_page);
    assert_eq!(snapshot.offset, 0);
    assert_eq!(
        *offsets.lock().unwrap_or_else(PoisonError::into_inner),
        vec![0, 3, 6]
    );
    Ok(())
}

#[tokio::test]
async fn changing_inputs_reloads_from_the_first_page() -> anyhow::Result<()> {
    let offsets: Arc<Mutex<Vec<u64>>> = Arc::default();
    let sync = paged(10, Arc::clone(&offsets));

    assert!(!sync.set_limit(4).await?);
    sync.load(PageParams::default()).await?;
    assert!(sync.load_next_page().await?);
    assert!(sync.set_limit(5).await?);
    assert!(!sync.set_limit(5).await?);
    assert!(sync.set_revalidation_key(Some("team-2".into())).await?);

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.limit, 5);
    assert_eq!(snapshot.all_page_records, vec![0, 1, 2, 3, 4]);
    assert_eq!(
        *offsets.lock().unwrap_or_else(PoisonError::into_inner),
        vec![0, 4, 0, 0]
    );
    Ok(())
}

#[tokio::test]
async fn session_timeout_in_a_finder_reaches_the_handler() -> anyhow::Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .route("/records", unauthorized())
        .always(ok(json!([])));
    let client = client(transport)?;
    client.session().set_token("expired")?;
    let mut events = client.events().subscribe(None);

    let finder_client = client.clone();
    let sync: Synchronizer<serde_json::Value> = Synchronizer::builder(
        move |_request: PageRequest<serde_json::Value>| {
            let client = finder_client.clone();
            async move {
                client
                    .get_json::<Vec<serde_json::Value>>("/records")
                    .await
                    .map(FinderOutput::Records)
            }
        },
        options(10),
    )
    .session_handler(Arc::new(client.clone()))
    .build();

    let outcome = sync.load(PageParams::default()).await;

    assert!(outcome.is_err_and(|err| err.is_session_timeout()));
    assert_eq!(sync.snapshot().error_message, None);
    assert_eq!(client.session().token()?, None);
    assert!(matches!(
        events.next().await.map(|envelope| envelope.event),
        Some(ClientEvent::SessionExpired { .. })
    ));
    Ok(())
}

/// First page `[0, 1, 2]` of nine; later pages patch stale rows before a gate opens.
fn gated_pages(gate: Arc<Semaphore>, untotalled: bool) -> Synchronizer<u32> {
    let records: Vec<u32> = (0..9).collect();
    Synchronizer::new(
        move |request: PageRequest<u32>| {
            let page = slice(&records, request.offset, request.limit);
            let gate = Arc::clone(&gate);
            async move {
                if request.offset == 0 {
                    return Ok::<_, RequestError>(FinderOutput::Page(
                        PageResponse::new(page).with_total(9),
                    ));
                }
                assert!(request.stale_while_revalidate().write(page.clone()));
                let _permit = gate.acquire().await.map_err(|_| RequestError::Cancelled)?;
                if untotalled {
                    Ok(FinderOutput::Records(page))
                } else {
                    Ok(FinderOutput::Page(PageResponse::new(page).with_total(9)))
                }
            }
        },
        options(3),
    )
}

#[tokio::test]
async fn stale_patch_during_next_page_keeps_earlier_pages() -> anyhow::Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let sync = gated_pages(Arc::clone(&gate), false);
    let mut observer = sync.subscribe();
    sync.load(PageParams::default()).await?;

    let next = tokio::spawn({
        let sync = sync.clone();
        async move { sync.load_next_page().await }
    });
    let provisional = wait_for(&mut observer, SETTLE, |snapshot| {
        snapshot.all_page_records == vec![0, 1, 2, 3, 4, 5]
    })
    .await?;
    assert!(provisional.loading_next_page);
    assert_eq!(provisional.records_total_count, Some(9));
    assert!(provisional.has_next_page);

    gate.add_permits(1);
    assert!(next.await??);

    let settled = sync.snapshot();
    assert_eq!(settled.all_page_records, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(settled.records_total_count, Some(9));
    assert!(!settled.loading_next_page);
    Ok(())
}

#[tokio::test]
async fn next_page_without_a_total_keeps_the_known_one() -> anyhow::Result<()> {
    let gate = Arc::new(Semaphore::new(2));
    let sync = gated_pages(gate, true);
    sync.load(PageParams::default()).await?;

    assert!(sync.load_next_page().await?);
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.all_page_records, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(snapshot.records_total_count, Some(9));
    assert!(snapshot.has_next_page);

    assert!(sync.load_next_page().await?);
    assert_eq!(sync.snapshot().all_page_records, (0..9).collect::<Vec<_>>());
    assert!(!sync.snapshot().has_next_page);
    Ok(())
}

#[tokio::test]
async fn changing_the_search_after_a_failed_first_load_refetches() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let sync = {
        let calls = Arc::clone(&calls);
        Synchronizer::new(
            move |request: PageRequest<u32>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match request.search_term {
                        Some(_) => Ok(FinderOutput::Records(vec![11, 12])),
                        None => Err(RequestError::Api {
                            status: 422,
                            message: "Pick a filter first".into(),
                        }),
                    }
                }
            },
            options(10),
        )
    };

    assert!(sync.load(PageParams::default()).await.is_err());
    assert_eq!(
        sync.snapshot().error_message.as_deref(),
        Some("Pick a filter first")
    );

    assert!(sync.set_search_term(Some("abc".into())).await?);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.all_page_records, vec![11, 12]);
    assert_eq!(snapshot.error_message, None);
    Ok(())
}
