use edgeflow::config::Config;
use edgeflow::plumbing::{self, Mapper, Valve};
use edgeflow::provider::DirectProvider;
use edgeflow::tester::{self, Condition, Tester};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn letters(range: std::ops::RangeInclusive<char>) -> Vec<String> {
  range.map(String::from).collect()
}

// ============================================================================
// Pressure Reliever
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_reliever_keeps_newest_tuples() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("reliever_drop");
  let input = topology.strings(letters('A'..='H')).unwrap();
  let relieved = plumbing::pressure_reliever(&input, |_| (), 3).unwrap();
  let slow = plumbing::blocking_delay(&relieved, Duration::from_millis(100)).unwrap();
  let expected = ["A", "F", "G", "H"].map(String::from).to_vec();
  let contents = tester::stream_contents(&slow, expected).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid, "got {:?}", contents.result());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_reliever_drops_nothing_within_capacity() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("reliever_keep");
  let input = topology.strings(letters('A'..='H')).unwrap();
  let relieved = plumbing::pressure_reliever(&input, |_| (), 8).unwrap();
  let slow = plumbing::blocking_delay(&relieved, Duration::from_millis(20)).unwrap();
  let contents = tester::stream_contents(&slow, letters('A'..='H')).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid, "got {:?}", contents.result());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_reliever_partitions_are_independent() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("reliever_keys");
  let input = topology.of(0..20u32).unwrap();
  let relieved = plumbing::pressure_reliever(&input, |n| n % 2, 2).unwrap();
  let slow = plumbing::blocking_delay(&relieved, Duration::from_millis(100)).unwrap();
  // First tuple goes straight through; each parity keeps its newest two.
  let contents = tester::contents_unordered(&slow, vec![0, 16, 18, 17, 19]).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid, "got {:?}", contents.result());
}

// ============================================================================
// Gate and Valve
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_gate_bounds_unreleased_tuples() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("gate");
  let permits = Arc::new(Semaphore::new(1));
  let observed = Arc::new(Mutex::new(Vec::new()));

  let input = topology.of(0..10).unwrap();
  let gated = plumbing::gate(&input, Arc::clone(&permits)).unwrap();
  {
    let permits = Arc::clone(&permits);
    let observed = Arc::clone(&observed);
    gated
      .sink(move |_| {
        observed.lock().unwrap().push(permits.available_permits());
        permits.add_permits(1);
      })
      .unwrap();
  }
  let count = tester::tuple_count(&gated, 10).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(count), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid);
  let observed = observed.lock().unwrap();
  assert_eq!(observed.len(), 10);
  assert!(observed.iter().all(|available| *available <= 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_closed_valve_passes_nothing() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("valve");
  let valve = Valve::new(false);
  let input = topology.of(1..=4).unwrap();
  let passed = plumbing::valve(&input, &valve).unwrap();
  let count = tester::tuple_count(&passed, 0).unwrap();

  let job = provider.submit(&topology).await.unwrap();
  job.wait_closed(Duration::from_secs(5)).await.unwrap();
  assert!(count.valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_valve_toggled_from_another_thread() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("valve_toggle");
  let valve = Valve::new(false);
  let input = topology
    .poll(|| Some(1u8), Duration::from_millis(5))
    .unwrap();
  let passed = plumbing::valve(&input, &valve).unwrap();
  let count = tester::at_least_tuple_count(&passed, 3).unwrap();

  let job = provider.submit(&topology).await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(count.result(), 0);

  let remote = valve.clone();
  std::thread::spawn(move || remote.set_open(true)).join().unwrap();
  let deadline = Instant::now() + Duration::from_secs(5);
  while !count.valid() && Instant::now() < deadline {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(count.valid());
  job.stop().await.unwrap();
}

// ============================================================================
// Pacing
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_throttle_paces_in_order() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("throttle");
  let input = topology.strings(["a", "b", "c", "d"]).unwrap();
  let paced = plumbing::blocking_throttle(&input, Duration::from_millis(300)).unwrap();
  let contents = tester::stream_contents(&paced, letters('a'..='d')).unwrap();

  let started = Instant::now();
  let job = provider.submit(&topology).await.unwrap();
  job.wait_closed(Duration::from_secs(5)).await.unwrap();
  let elapsed = started.elapsed();

  assert!(contents.valid(), "got {:?}", contents.result());
  assert!(elapsed >= Duration::from_millis(900), "took {elapsed:?}");
  assert!(elapsed < Duration::from_millis(1250), "took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_one_shot_delay_holds_first_tuple_only() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("one_shot");
  let input = topology.of(1..=5).unwrap();
  let delayed = plumbing::blocking_one_shot_delay(&input, Duration::from_millis(200)).unwrap();
  let contents = tester::stream_contents(&delayed, vec![1, 2, 3, 4, 5]).unwrap();

  let started = Instant::now();
  let job = provider.submit(&topology).await.unwrap();
  job.wait_closed(Duration::from_secs(5)).await.unwrap();
  let elapsed = started.elapsed();

  assert!(contents.valid());
  assert!(elapsed >= Duration::from_millis(200), "took {elapsed:?}");
  assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
}

// ============================================================================
// Isolation and Fan-Out
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_ordered_isolate_keeps_order() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("isolate");
  let input = topology.of(0..100).unwrap();
  let isolated = input.isolate(true).unwrap();
  let contents = tester::stream_contents(&isolated, (0..100).collect()).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_unordered_isolate_delivers_everything() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("isolate_unordered");
  let input = topology.of(0..100).unwrap();
  let isolated = input.isolate(false).unwrap();
  let doubled = isolated.map(|n| n * 2).unwrap();
  let contents = tester::contents_unordered(&doubled, (0..100).map(|n| n * 2).collect()).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid, "got {:?}", contents.result());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_joins_results_in_input_order() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("concurrent");
  let input = topology.of(1..=5).unwrap();
  let mappers: Vec<Mapper<i32, i32>> = vec![
    Arc::new(|n: i32| {
      std::thread::sleep(Duration::from_millis(5));
      n * 10
    }),
    Arc::new(|n: i32| n + 1),
    Arc::new(|n: i32| -n),
  ];
  let joined = plumbing::concurrent_map(&input, mappers, |results| results).unwrap();
  let expected = (1..=5).map(|n| vec![n * 10, n + 1, -n]).collect();
  let contents = tester::stream_contents(&joined, expected).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid, "got {:?}", contents.result());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_channels_overlap() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("concurrent_timing");
  let input = topology.of(1..=5).unwrap();
  let slow = |offset: i32| -> Mapper<i32, i32> {
    Arc::new(move |n: i32| {
      std::thread::sleep(Duration::from_millis(100));
      n + offset
    })
  };
  let mappers = vec![slow(0), slow(10), slow(20)];
  let joined = plumbing::concurrent_map(&input, mappers, |results| results).unwrap();
  let expected = (1..=5).map(|n| vec![n, n + 10, n + 20]).collect();
  let contents = tester::stream_contents(&joined, expected).unwrap();

  let started = Instant::now();
  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
    .await
    .unwrap();
  let elapsed = started.elapsed();

  assert!(valid, "got {:?}", contents.result());
  // Five inputs at 100 ms per channel: about 500 ms when channels overlap,
  // 1500 ms when they run one after another.
  assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_keeps_order_within_channel() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("parallel");
  let input = topology.of(0..30usize).unwrap();
  let tagged = plumbing::parallel_map(&input, 3, |n, _| *n, |n, channel| (channel, n)).unwrap();
  let count = tester::tuple_count(&tagged, 30).unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  {
    let seen = Arc::clone(&seen);
    tagged.sink(move |pair| seen.lock().unwrap().push(pair)).unwrap();
  }

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(count), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid);

  let seen = seen.lock().unwrap();
  for channel in 0..3 {
    let values: Vec<usize> = seen
      .iter()
      .filter(|(c, _)| *c == channel)
      .map(|(_, n)| *n)
      .collect();
    assert_eq!(values, (0..30).filter(|n| n % 3 == channel).collect::<Vec<_>>());
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_balanced_parallel_favors_fast_channel() {
  init_tracing();
  let provider = DirectProvider::new().unwrap();
  let topology = provider.new_topology("balanced");
  let input = topology.of(0..24).unwrap();
  let done = plumbing::parallel_balanced(&input, 2, |channel, index| {
    let cost = if index == 0 { 60 } else { 30 };
    plumbing::blocking_delay(channel, Duration::from_millis(cost))?.map(move |_| index)
  })
  .unwrap();
  let count = tester::tuple_count(&done, 24).unwrap();
  let per_channel = Arc::new(Mutex::new([0usize; 2]));
  {
    let per_channel = Arc::clone(&per_channel);
    done
      .sink(move |index| per_channel.lock().unwrap()[index] += 1)
      .unwrap();
  }

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(count), Duration::from_secs(10))
    .await
    .unwrap();
  assert!(valid);

  let [slow, fast] = *per_channel.lock().unwrap();
  assert!(slow >= 1 && fast >= 1, "slow {slow}, fast {fast}");
  assert!(fast * 2 >= slow * 3, "slow {slow}, fast {fast}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_plumbing_follows_provider_config() {
  init_tracing();
  let config = Config::from_json_str(r#"{ "plumbing": { "parallel_channel_capacity": 2 } }"#).unwrap();
  let provider = DirectProvider::with_config(config).unwrap();
  let topology = provider.new_topology("configured");
  assert_eq!(topology.plumbing().parallel_channel_capacity, 2);

  let input = topology.of(0..10).unwrap();
  let doubled = plumbing::parallel_map(&input, 2, |n, _| *n as usize, |n, _| n * 2).unwrap();
  let contents = tester::contents_unordered(&doubled, (0..10).map(|n| n * 2).collect()).unwrap();

  let valid = Tester::default()
    .complete(&provider, &topology, Arc::new(contents), Duration::from_secs(5))
    .await
    .unwrap();
  assert!(valid);
}
