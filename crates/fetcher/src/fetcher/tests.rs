use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use super::*;
use crate::testing::MockTransport;

const HOME: &str = "https://contoso.example/sites/home";
const L1: &str = "6f2a8c1e-0000-4000-8000-0000000000a1";
const L2: &str = "6f2a8c1e-0000-4000-8000-0000000000a2";
const SSP: &str = "5e1f0000-0000-4000-8000-00000000000f";
const TERM_SET: &str = "0d3c5a7e-1111-4222-8333-444455556666";

fn fetcher(transport: &Arc<MockTransport>) -> Fetcher {
	Fetcher::builder(transport.clone()).build().unwrap()
}

fn home() -> SiteKey {
	SiteKey::default_site()
}

async fn wait_for_queue(fetcher: &Fetcher, len: usize) {
	while fetcher.inner.gate.queued() < len {
		tokio::task::yield_now().await;
	}
}

struct Failing;

#[async_trait]
impl StartupRoutines for Failing {
	async fn startup_routines(&self, _fetcher: &Fetcher) -> Result<()> {
		Err(Error::remote(500, "startup exploded"))
	}
}

/// Counts runs and blocks until released.
#[derive(Default)]
struct Blocking {
	runs: Arc<AtomicUsize>,
	release: Arc<Notify>,
}

#[async_trait]
impl StartupRoutines for Blocking {
	async fn startup_routines(&self, _fetcher: &Fetcher) -> Result<()> {
		self.runs.fetch_add(1, Ordering::SeqCst);
		self.release.notified().await;
		Ok(())
	}
}

/// Reads the default library through the fetcher while initializing.
struct ReadsLibrary(Arc<Mutex<Option<String>>>);

#[async_trait]
impl StartupRoutines for ReadsLibrary {
	async fn startup_routines(&self, fetcher: &Fetcher) -> Result<()> {
		let id = fetcher.default_library_id(&SiteKey::default_site()).await?;
		*self.0.lock() = Some(id);
		Ok(())
	}
}

#[tokio::test]
async fn test_calls_before_initialize_run_in_order() {
	let transport = MockTransport::new();
	let fetcher = fetcher(&transport);
	let order = Arc::new(Mutex::new(Vec::new()));

	let mut tasks = Vec::new();
	for i in 0..6 {
		let fetcher = fetcher.clone();
		let order = order.clone();
		tasks.push(tokio::spawn(async move {
			let handle = fetcher.site(None).await.unwrap();
			order.lock().push(i);
			handle
		}));
	}
	wait_for_queue(&fetcher, 6).await;

	assert_eq!(fetcher.status(), Status::NotInitialized);
	assert_eq!(transport.open_count.load(Ordering::SeqCst), 0);
	assert!(order.lock().is_empty());

	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();
	let mut handles = Vec::new();
	for task in tasks {
		handles.push(task.await.unwrap());
	}

	assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
	assert!(handles.iter().all(|h| h.same_handle(&handles[0])));
	assert_eq!(transport.open_count.load(Ordering::SeqCst), 1);
	assert_eq!(fetcher.status(), Status::Ready);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_failed_startup_is_terminal() {
	let transport = MockTransport::new();
	let fetcher = Fetcher::builder(transport.clone()).startup(Failing).build().unwrap();

	let err = fetcher.initialize(PlatformContext::new(HOME)).await.unwrap_err();
	assert_eq!(err, Error::remote(500, "startup exploded"));
	assert_eq!(fetcher.status(), Status::Error);

	let ready = tokio::time::timeout(Duration::from_secs(5), fetcher.ready()).await;
	assert!(ready.is_err(), "ready() must not resolve after a failed initialization");
	let site = tokio::time::timeout(Duration::from_secs(5), fetcher.site(None)).await;
	assert!(site.is_err());
}

#[tokio::test]
async fn test_invalid_context_fails_initialization() {
	let transport = MockTransport::new();
	let fetcher = fetcher(&transport);

	let err = fetcher.initialize(PlatformContext::new("not a url")).await.unwrap_err();
	assert!(matches!(err, Error::Initialization(_)));
	assert_eq!(fetcher.status(), Status::Error);
	assert_eq!(transport.open_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_default_handle_fails_initialization() {
	let transport = MockTransport::new();
	*transport.fail_open.lock() = Some(Error::remote(401, "unauthorized"));
	let fetcher = fetcher(&transport);

	let err = fetcher.initialize(PlatformContext::new(HOME)).await.unwrap_err();
	assert_eq!(err, Error::remote(401, "unauthorized"));
	assert_eq!(fetcher.status(), Status::Error);
}

#[tokio::test]
async fn test_reentrant_initialize_joins_running_one() {
	let transport = MockTransport::new();
	let startup = Blocking::default();
	let runs = startup.runs.clone();
	let release = startup.release.clone();
	let fetcher = Fetcher::builder(transport.clone()).startup(startup).build().unwrap();

	let leader = {
		let fetcher = fetcher.clone();
		tokio::spawn(async move { fetcher.initialize(PlatformContext::new(HOME)).await })
	};
	while runs.load(Ordering::SeqCst) == 0 {
		tokio::task::yield_now().await;
	}
	assert_eq!(fetcher.status(), Status::Initializing);

	let follower = {
		let fetcher = fetcher.clone();
		tokio::spawn(async move { fetcher.initialize(PlatformContext::new(HOME)).await })
	};
	wait_for_queue(&fetcher, 1).await;
	release.notify_one();

	assert_eq!(leader.await.unwrap(), Ok(()));
	assert_eq!(follower.await.unwrap(), Ok(()));
	assert_eq!(runs.load(Ordering::SeqCst), 1);
	assert_eq!(transport.open_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_startup_routines_may_use_the_fetcher() {
	let transport = MockTransport::new();
	transport.respond("web/DefaultDocumentLibrary", Ok(json!({ "d": { "Id": format!("{{{L1}}}") } })));
	let seen = Arc::new(Mutex::new(None));
	let fetcher = Fetcher::builder(transport.clone())
		.startup(ReadsLibrary(seen.clone()))
		.build()
		.unwrap();

	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();
	assert_eq!(seen.lock().as_deref(), Some(L1));
}

#[tokio::test]
async fn test_reinitialize_rebinds_default_site() {
	let transport = MockTransport::new();
	let fetcher = fetcher(&transport);

	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();
	let first = fetcher.site(None).await.unwrap();

	fetcher
		.initialize(PlatformContext::new("https://fabrikam.example/sites/root"))
		.await
		.unwrap();
	let second = fetcher.site(None).await.unwrap();

	assert_eq!(second.url().as_str(), "https://fabrikam.example/sites/root");
	assert!(!first.same_handle(&second));
	assert_eq!(fetcher.status(), Status::Ready);

	let opened: Vec<String> = transport.opened.lock().iter().map(|url| url.to_string()).collect();
	assert_eq!(opened, [HOME, "https://fabrikam.example/sites/root"]);
}

#[tokio::test]
async fn test_configured_sites_are_registered() {
	let transport = MockTransport::new();
	let config = FetcherConfig::default().site("hr", "https://contoso.example/sites/hr");
	let fetcher = Fetcher::builder(transport.clone()).config(config).build().unwrap();
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let hr = fetcher.site(Some(&SiteKey::new("hr"))).await.unwrap();
	assert_eq!(hr.url().as_str(), "https://contoso.example/sites/hr");

	let current = fetcher.set_site(&SiteKey::new("hr")).await.unwrap();
	assert_eq!(current.url().as_str(), "https://contoso.example/sites/hr");
	assert!(current.key().is_current());
}

#[test]
fn test_invalid_configured_site_fails_build() {
	let config = FetcherConfig::default().site("hr", "sites/hr");
	let err = Fetcher::builder(MockTransport::new()).config(config).build().unwrap_err();
	assert!(matches!(err, Error::InvalidUrl { .. }));
}

#[tokio::test]
async fn test_is_default_library() {
	let transport = MockTransport::new();
	transport.respond("web/DefaultDocumentLibrary", Ok(json!({ "d": { "Id": L1 } })));
	let fetcher = fetcher(&transport);

	fetcher
		.initialize(PlatformContext::new(HOME).with_list_id(format!("{{{}}}", L1.to_uppercase())))
		.await
		.unwrap();
	assert_eq!(fetcher.is_default_library(&home()).await, Ok(true));

	fetcher
		.initialize(PlatformContext::new(HOME).with_list_id(L2))
		.await
		.unwrap();
	assert_eq!(fetcher.is_default_library(&home()).await, Ok(false));
}

#[tokio::test]
async fn test_missing_libraries_are_not_found() {
	let transport = MockTransport::new();
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	assert!(matches!(fetcher.default_library_id(&home()).await, Err(Error::NotFound(_))));
	assert!(matches!(fetcher.current_library_id().await, Err(Error::NotFound(_))));

	transport.respond("web/DefaultDocumentLibrary", Ok(json!({ "d": null })));
	assert!(matches!(fetcher.default_library_id(&home()).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_get_list() {
	let transport = MockTransport::new();
	transport.respond(
		"web/lists/getbytitle('Documents')",
		Ok(json!({ "d": { "Id": L1, "Title": "Documents", "BaseTemplate": 101 } })),
	);
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let list = fetcher.get_list(&home(), &ListKey::Title("Documents".into())).await.unwrap();
	assert_eq!(list.title, "Documents");
	assert_eq!(list.base_template, Some(101));
	assert_eq!(list.item_count, None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_batch_factory_coalesces_window() {
	let transport = MockTransport::new();
	transport.respond("web", Ok(json!({ "Title": "Home" })));
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let factory = fetcher.batch_factory(None, home());
	assert_eq!(factory.key().window, Duration::from_millis(50));

	let mut responses = Vec::new();
	for _ in 0..10 {
		let batch = factory.next().await.unwrap();
		responses.push(batch.add(RestRequest::get("web")));
	}
	for response in responses {
		assert_eq!(response.await, Ok(json!({ "Title": "Home" })));
	}
	assert_eq!(transport.batch_sizes(), vec![10]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_batch_factory_splits_at_cap() {
	let transport = MockTransport::new();
	transport.respond("web", Ok(json!({})));
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let factory = fetcher.batch_factory(Some(Duration::from_millis(100)), home());
	let mut responses = Vec::new();
	for _ in 0..51 {
		responses.push(factory.next().await.unwrap().add(RestRequest::get("web")));
	}
	for response in responses {
		assert!(response.await.is_ok());
	}
	assert_eq!(transport.batch_sizes(), vec![50, 1]);
}

fn content_types(ids: &[&str]) -> serde_json::Value {
	let rows: Vec<_> = ids.iter().map(|id| json!({ "StringId": id })).collect();
	json!({ "d": { "results": rows } })
}

#[tokio::test]
async fn test_concurrent_content_type_lookups_share_one_call() {
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&["0x01", "0x0101"])));
	let gate = Arc::new(Notify::new());
	*transport.send_gate.lock() = Some(gate.clone());
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let mut tasks = Vec::new();
	for _ in 0..12 {
		let fetcher = fetcher.clone();
		tasks.push(tokio::spawn(async move { fetcher.content_type_ids(&home(), None).await }));
	}
	tokio::time::sleep(Duration::from_millis(20)).await;
	gate.notify_one();

	let mut results = Vec::new();
	for task in tasks {
		results.push(task.await.unwrap().unwrap());
	}
	assert_eq!(transport.send_count.load(Ordering::SeqCst), 1);
	assert!(results.iter().all(|ids| **ids == *results[0]));
}

fn taxonomy_field() -> serde_json::Value {
	json!({
		"d": {
			"Id": "f0000000-0000-4000-8000-000000000001",
			"InternalName": "Region",
			"Title": "Region",
			"TypeAsString": "TaxonomyFieldType",
			"SspId": SSP,
			"TermSetId": TERM_SET
		}
	})
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_find_field_batches_content_type_lookups() {
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&["0x01", "0x0101"])));
	transport.respond("web/contenttypes('0x0101')/fields/getbyinternalnameortitle('Region')", Ok(taxonomy_field()));
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let field = fetcher.find_field(&home(), None, "Region").await.unwrap().unwrap();
	assert_eq!(field.internal_name, "Region");
	assert_eq!(transport.batch_sizes(), vec![2]);

	assert_eq!(fetcher.find_field(&home(), None, "Missing").await, Ok(None));
	assert_eq!(transport.send_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_find_field_over_many_content_types_respects_batch_cap() {
	let ids: Vec<String> = (0..60).map(|i| format!("0x0100{i:02}")).collect();
	let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&id_refs)));
	transport.respond("web/contenttypes('0x010055')/fields/getbyinternalnameortitle('Region')", Ok(taxonomy_field()));
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let field = fetcher.find_field(&home(), None, "Region").await.unwrap().unwrap();
	assert_eq!(field.internal_name, "Region");
	assert_eq!(transport.batch_sizes(), vec![50, 10]);
}

#[tokio::test]
async fn test_reinitialize_forgets_context_content_types() {
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&["0x01"])));
	let config = FetcherConfig::default().site("hr", "https://contoso.example/sites/hr");
	let fetcher = Fetcher::builder(transport.clone()).config(config).build().unwrap();
	let hr = SiteKey::new("hr");

	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();
	assert_eq!(&*fetcher.content_type_ids(&home(), None).await.unwrap(), ["0x01".to_string()]);
	assert_eq!(&*fetcher.content_type_ids(&hr, None).await.unwrap(), ["0x01".to_string()]);

	transport.respond("web/contenttypes", Ok(content_types(&["0x02"])));
	fetcher
		.initialize(PlatformContext::new("https://fabrikam.example/sites/root"))
		.await
		.unwrap();

	assert_eq!(&*fetcher.content_type_ids(&home(), None).await.unwrap(), ["0x02".to_string()]);
	assert_eq!(&*fetcher.content_type_ids(&hr, None).await.unwrap(), ["0x01".to_string()]);
}

#[tokio::test]
async fn test_unnamed_site_follows_set_site() {
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&["0x01"])));
	let config = FetcherConfig::default().site("hr", "https://contoso.example/sites/hr");
	let fetcher = Fetcher::builder(transport.clone()).config(config).build().unwrap();
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let current = SiteKey::current();
	assert_eq!(fetcher.site(None).await.unwrap().url().as_str(), HOME);
	assert_eq!(&*fetcher.content_type_ids(&current, None).await.unwrap(), ["0x01".to_string()]);

	transport.respond("web/contenttypes", Ok(content_types(&["0x02"])));
	fetcher.set_site(&SiteKey::new("hr")).await.unwrap();

	let unnamed = fetcher.site(None).await.unwrap();
	assert_eq!(unnamed.url().as_str(), "https://contoso.example/sites/hr");
	assert!(unnamed.key().is_current());
	assert_eq!(fetcher.site(Some(&home())).await.unwrap().url().as_str(), HOME);
	assert_eq!(&*fetcher.content_type_ids(&current, None).await.unwrap(), ["0x02".to_string()]);
}

fn terms_response(terms: &[(&str, &str)]) -> String {
	let items: Vec<_> = terms
		.iter()
		.map(|(id, path)| json!({ "Id": format!("/Guid({id})/"), "Name": path, "IsRoot": true, "PathOfTerm": path }))
		.collect();
	json!([{ "ErrorInfo": null }, 9, { "_Child_Items_": items }]).to_string()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_ensure_field_term_path() {
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&["0x0101"])));
	transport.respond("web/contenttypes('0x0101')/fields/getbyinternalnameortitle('Region')", Ok(taxonomy_field()));
	transport.respond_raw(
		"_vti_bin/client.svc/ProcessQuery",
		Ok(terms_response(&[("aaaaaaaa-0000-4000-8000-000000000001", "Europe")])),
	);
	transport.respond_raw(
		"_vti_bin/TaxonomyInternalService.json/CreateTaxonomyItem",
		Ok(json!({ "d": { "Id": "bbbbbbbb-0000-4000-8000-000000000002" } }).to_string()),
	);
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let id = fetcher.ensure_field_term_path(&home(), None, "Region", "Europe;Norway").await.unwrap();
	assert_eq!(id, "bbbbbbbb-0000-4000-8000-000000000002");

	let creates = transport.raw_posts_to("_vti_bin/TaxonomyInternalService.json/CreateTaxonomyItem");
	assert_eq!(creates.len(), 1);
	let body: serde_json::Value = serde_json::from_str(&creates[0].body).unwrap();
	assert_eq!(body["parentId"], "aaaaaaaa-0000-4000-8000-000000000001");
	assert_eq!(body["sspId"], SSP);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_ensure_term_path_requires_taxonomy_field() {
	let transport = MockTransport::new();
	transport.respond("web/contenttypes", Ok(content_types(&["0x01"])));
	transport.respond(
		"web/contenttypes('0x01')/fields/getbyinternalnameortitle('Title')",
		Ok(json!({ "Id": "t", "InternalName": "Title", "TypeAsString": "Text" })),
	);
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();

	let not_taxonomy = fetcher.ensure_field_term_path(&home(), None, "Title", "A").await;
	assert!(matches!(not_taxonomy, Err(Error::NotFound(_))));
	let missing = fetcher.ensure_field_term_path(&home(), None, "Nope", "A").await;
	assert!(matches!(missing, Err(Error::NotFound(_))));
	assert!(transport.raw_posts.lock().is_empty());
}

#[tokio::test]
async fn test_taxonomy_reads_through_the_fetcher() {
	let transport = MockTransport::new();
	transport.respond_raw(
		"_vti_bin/client.svc/ProcessQuery",
		Ok(terms_response(&[("aaaaaaaa-0000-4000-8000-000000000001", "A")])),
	);
	transport.respond_raw(
		"_vti_bin/client.svc/ProcessQuery",
		Ok(json!([{ "ErrorInfo": null }, { "_ObjectType_": "SP.Taxonomy.TermStore", "Id": SSP }]).to_string()),
	);
	let fetcher = fetcher(&transport);
	fetcher.initialize(PlatformContext::new(HOME)).await.unwrap();
	let term_set = Uuid::parse_str(TERM_SET).unwrap();

	let matched = fetcher.resolve_closest_prefix(&home(), term_set, "A;B").await.unwrap();
	assert_eq!(matched.index, Some(0));
	assert_eq!(fetcher.default_term_store_id(&home()).await.unwrap(), SSP);
}
