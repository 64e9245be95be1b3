//! [`ParallelPool`]: run a function over a stream of items on a fixed
//! number of workers, yielding results as they complete.

use std::{
  fmt::{Debug, Display},
  future::Future,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use tokio::{
  sync::mpsc,
  task::{JoinHandle, JoinSet},
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ParallelPool {
  workers:       usize,
  drain_timeout: Duration,
}

impl ParallelPool {
  pub fn new(workers: usize) -> Self {
    Self { workers: workers.max(1), drain_timeout: DRAIN_TIMEOUT }
  }

  pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
    self.drain_timeout = timeout;
    self
  }

  /// Apply `f` to every item. Items that fail are logged with the item and
  /// skipped, and a worker that panics is replaced by a new one.
  pub fn map<I, T, R, E, F, Fut>(&self, items: I, f: F) -> PoolResults<R>
  where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Debug + Send + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = tokio::spawn(drive(
      items.into_iter(),
      f,
      self.workers,
      Arc::clone(&stop),
      tx,
    ));
    PoolResults { rx, stop, driver: Some(driver), drain_timeout: self.drain_timeout }
  }
}

async fn drive<It, T, R, E, F, Fut>(
  mut items: It,
  f: F,
  workers: usize,
  stop: Arc<AtomicBool>,
  tx: mpsc::UnboundedSender<R>,
) where
  It: Iterator<Item = T>,
  T: Debug + Send + 'static,
  R: Send + 'static,
  E: Display + Send + 'static,
  F: Fn(T) -> Fut,
  Fut: Future<Output = Result<R, E>> + Send + 'static,
{
  let mut running = JoinSet::new();
  loop {
    while running.len() < workers && !stop.load(Ordering::SeqCst) {
      match items.next() {
        Some(item) => {
          let label = format!("{item:?}");
          let fut = f(item);
          running.spawn(async move { (label, fut.await) });
        }
        None => break,
      }
    }
    match running.join_next().await {
      None => break,
      Some(Ok((_, Ok(result)))) => {
        if tx.send(result).is_err() {
          stop.store(true, Ordering::SeqCst);
        }
      }
      Some(Ok((item, Err(err)))) => tracing::error!(%item, error = %err, "pool item failed"),
      Some(Err(err)) => tracing::error!(error = %err, "pool worker died; starting another"),
    }
  }
}

/// Results of [`ParallelPool::map`], in completion order.
pub struct PoolResults<R> {
  rx:            mpsc::UnboundedReceiver<R>,
  stop:          Arc<AtomicBool>,
  driver:        Option<JoinHandle<()>>,
  drain_timeout: Duration,
}

impl<R> PoolResults<R> {
  pub async fn next(&mut self) -> Option<R> { self.rx.recv().await }

  /// Stop starting new items. Results already running are still delivered.
  pub fn stop(&self) { self.stop.store(true, Ordering::SeqCst); }

  /// Stop, wait for running items up to the drain timeout, and discard
  /// anything not yet received.
  pub async fn shutdown(mut self) {
    self.stop();
    if let Some(mut driver) = self.driver.take()
      && tokio::time::timeout(self.drain_timeout, &mut driver).await.is_err()
    {
      tracing::warn!("pool workers did not finish in {:?}; aborting", self.drain_timeout);
      driver.abort();
    }
    self.rx.close();
    let mut discarded = 0;
    while self.rx.try_recv().is_ok() {
      discarded += 1;
    }
    if discarded > 0 {
      tracing::warn!("discarding {discarded} undelivered results");
    }
  }
}

impl<R> Drop for PoolResults<R> {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::BTreeSet,
    io,
    sync::Mutex,
  };

  use super::*;

  #[tokio::test]
  async fn failures_are_skipped() {
    let pool = ParallelPool::new(3);
    let mut results = pool.map(0..10_u32, |n| async move {
      if n % 4 == 0 { Err(format!("bad item {n}")) } else { Ok(n * 2) }
    });
    let mut seen = BTreeSet::new();
    while let Some(n) = results.next().await {
      seen.insert(n);
    }
    assert_eq!(seen, BTreeSet::from([2, 4, 6, 10, 12, 14, 18]));
  }

  #[derive(Clone, Default)]
  struct Captured(Arc<Mutex<Vec<u8>>>);

  impl Captured {
    fn text(&self) -> String { String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned() }
  }

  impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
  }

  #[tokio::test]
  async fn failure_log_names_the_item() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
      .with_writer(move || writer.clone())
      .with_ansi(false)
      .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let pool = ParallelPool::new(2);
    let batches = vec![vec!["c1".to_owned(), "c2".to_owned()], vec!["c3".to_owned()]];
    let mut results = pool.map(batches, |batch| async move {
      if batch.contains(&"c3".to_owned()) { Err("no such case") } else { Ok(batch.len()) }
    });
    assert_eq!(results.next().await, Some(2));
    assert_eq!(results.next().await, None);

    let logs = captured.text();
    let failed: Vec<&str> = logs.lines().filter(|l| l.contains("pool item failed")).collect();
    assert_eq!(failed.len(), 1, "{logs}");
    assert!(failed[0].contains(r#"item=["c3"]"#), "{logs}");
    assert!(failed[0].contains("error=no such case"), "{logs}");
  }

  #[tokio::test]
  async fn panicking_item_does_not_stop_the_pool() {
    let pool = ParallelPool::new(2);
    let mut results = pool.map(0..5_u32, |n| async move {
      assert_ne!(n, 2, "item two panics");
      Ok::<_, String>(n)
    });
    let mut seen = vec![];
    while let Some(n) = results.next().await {
      seen.push(n);
    }
    seen.sort_unstable();
    assert_eq!(seen, [0, 1, 3, 4]);
  }

  #[tokio::test]
  async fn stop_halts_new_items() {
    let pool = ParallelPool::new(1).with_drain_timeout(Duration::from_secs(5));
    let mut results = pool.map(0..1000_u32, |n| async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok::<_, String>(n)
    });
    assert_eq!(results.next().await, Some(0));
    results.stop();
    let mut rest = 0;
    while results.next().await.is_some() {
      rest += 1;
    }
    assert!(rest <= 1, "{rest} items ran after stop");
    results.shutdown().await;
  }
}
