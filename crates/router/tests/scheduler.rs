use std::time::Duration;

use courier_router::testing::Recorder;
use courier_router::{Address, Message, Router, WorkContext};
use pretty_assertions::assert_eq;

struct Clock;

fn setup() -> (Router, Recorder) {
	let _ = tracing_subscriber::fmt::try_init();
	let router = Router::default();
	let recorder = Recorder::register(&router, Address::of::<Clock>(), WorkContext::Immediate).unwrap();
	(router, recorder)
}

async fn advance(ms: u64) {
	tokio::time::sleep(Duration::from_millis(ms)).await;
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
}

#[tokio::test(start_paused = true)]
async fn duplicate_id_before_fire_delivers_once() {
	let (router, recorder) = setup();
	let scheduler = router.scheduler();
	scheduler.after(Duration::from_millis(100)).send(Message::with_content(9, "first"), Address::of::<Clock>());
	scheduler.after(Duration::from_millis(100)).send(Message::with_content(9, "second"), Address::of::<Clock>());

	advance(150).await;
	let messages = recorder.messages();
	assert_eq!(messages.len(), 1);
	assert_eq!(messages[0].content::<&str>(), Some(&"first"));
}

#[tokio::test(start_paused = true)]
async fn same_id_after_fire_delivers_again() {
	let (router, recorder) = setup();
	router.scheduler().after(Duration::from_millis(10)).send(9, Address::of::<Clock>());
	advance(20).await;
	router.scheduler().after(Duration::from_millis(10)).send(9, Address::of::<Clock>());
	advance(20).await;
	assert_eq!(recorder.ids(), vec![9, 9]);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_fire_and_after_fire() {
	let (router, recorder) = setup();
	let early = router.scheduler().after(Duration::from_millis(50)).send(1, Address::of::<Clock>());
	let late = router.scheduler().after(Duration::from_millis(10)).send(2, Address::of::<Clock>());

	advance(20).await;
	assert!(!late.cancel());
	assert!(early.cancel());

	advance(100).await;
	assert_eq!(recorder.ids(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn finalize_cancels_pending_sends() {
	let (router, recorder) = setup();
	router.scheduler().after(Duration::from_millis(30)).send(1, Address::of::<Clock>());
	router.scheduler().after(Duration::from_millis(40)).send(2, Address::of::<Clock>());
	assert_eq!(router.scheduler().pending(Address::of::<Clock>()), 2);

	assert!(router.finalize(Address::of::<Clock>()));
	assert!(router.scheduler().is_idle());

	let again = Recorder::register(&router, Address::of::<Clock>(), WorkContext::Immediate).unwrap();
	advance(100).await;
	assert!(recorder.is_empty());
	assert!(again.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unregister_keeps_pending_sends_for_next_registration() {
	let (router, first) = setup();
	router.scheduler().after(Duration::from_millis(30)).send(4, Address::of::<Clock>());
	router.unregister(Address::of::<Clock>());

	let second = Recorder::register(&router, Address::of::<Clock>(), WorkContext::Immediate).unwrap();
	advance(50).await;
	assert!(first.is_empty());
	assert_eq!(second.ids(), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn fire_without_mailbox_is_tolerated() {
	let (router, recorder) = setup();
	let handle = router.message(6).to(Address::of::<Clock>()).schedule(Duration::from_millis(10));
	router.unregister(Address::of::<Clock>());

	advance(20).await;
	assert!(recorder.is_empty());
	assert!(handle.iter().all(|h| !h.is_pending()));
}
