use std::time::Duration;

use futures::stream;
use tokio::time::sleep;

use super::{Multiplexer, Work};

#[tokio::test]
async fn yields_singles_in_completion_order() -> anyhow::Result<()> {
    let mut mux = Multiplexer::new();
    let slow = mux.push(Work::single(async {
        sleep(Duration::from_millis(80)).await;
        Ok("slow")
    }));
    let fast = mux.push(Work::single(async { Ok("fast") }));
    let mid = mux.push(Work::single(async {
        sleep(Duration::from_millis(30)).await;
        Ok("mid")
    }));

    let mut results = Vec::new();
    while let Some(result) = mux.next().await? {
        results.push(result);
    }
    assert_eq!(results, vec![(fast, "fast"), (mid, "mid"), (slow, "slow")]);
    Ok(())
}

#[tokio::test]
async fn counts_single_and_sequence_results() -> anyhow::Result<()> {
    let mut mux = Multiplexer::new();
    let seq = mux.push(Work::sequence(stream::iter(vec![
        Ok::<_, anyhow::Error>(1),
        Ok(2),
        Ok(3),
    ])));
    let a = mux.push(Work::single(async { Ok(10) }));
    let b = mux.push(Work::single(async { Ok(20) }));

    let mut from_seq = Vec::new();
    let mut from_singles = Vec::new();
    while let Some((id, value)) = mux.next().await? {
        if id == seq {
            from_seq.push(value);
        } else {
            assert!(id == a || id == b);
            from_singles.push(value);
        }
    }
    // Sequence values keep their internal order; singles appear exactly once.
    assert_eq!(from_seq, vec![1, 2, 3]);
    from_singles.sort();
    assert_eq!(from_singles, vec![10, 20]);
    Ok(())
}

#[tokio::test]
async fn exhausted_sequence_retires_silently() -> anyhow::Result<()> {
    let mut mux = Multiplexer::new();
    mux.push(Work::sequence(stream::empty::<anyhow::Result<u8>>()));
    let only = mux.push(Work::single(async { Ok(9) }));

    assert_eq!(mux.next().await?, Some((only, 9)));
    assert_eq!(mux.next().await?, None);
    Ok(())
}

#[tokio::test]
async fn work_injected_mid_stream_appears() -> anyhow::Result<()> {
    let mut mux = Multiplexer::new();
    let first = mux.push(Work::single(async { Ok("first") }));

    let (id, value) = mux.next().await?.expect("initial result");
    assert_eq!((id, value), (first, "first"));

    let late = mux.push(Work::single(async {
        sleep(Duration::from_millis(10)).await;
        Ok("late")
    }));
    assert_eq!(mux.next().await?, Some((late, "late")));
    assert_eq!(mux.next().await?, None);
    Ok(())
}

#[tokio::test]
async fn error_terminates_and_cancels_siblings() {
    let mut mux = Multiplexer::new();
    // An endless sequence that would run forever if not cancelled.
    mux.push(Work::sequence(stream::unfold(0u32, |n| async move {
        sleep(Duration::from_millis(5)).await;
        Some((Ok::<_, anyhow::Error>(n), n + 1))
    })));
    mux.push(Work::single(async {
        sleep(Duration::from_millis(25)).await;
        anyhow::bail!("boom")
    }));

    let err = loop {
        match mux.next().await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("expected an error"),
            Err(e) => break e,
        }
    };
    assert!(format!("{:#}", err).contains("boom"));

    // Finished: nothing further is delivered.
    assert!(mux.next().await.unwrap().is_none());
    assert_eq!(mux.pending(), 0);
}
