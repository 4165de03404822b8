use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotwise::adapters::Adapters;
use slotwise::engine::EngineOptions;
use slotwise::tenant::{TenantManager, TenantSettings};
use slotwise::wire;

// ── Test infrastructure ──────────────────────────────────────

const SLOT_0700: &str = "'2025-01-10', '07:00', '08:00'";
const SLOT_0900: &str = "'2025-01-10', '09:00', '10:00'";

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    // Background jobs stay out of the way; tests drive sweeps and ticks explicitly.
    let settings = TenantSettings {
        engine: EngineOptions {
            admin_secret: Some("s3cret".into()),
            ..EngineOptions::default()
        },
        sweep_interval: Duration::from_secs(3600),
        lifecycle_interval: Duration::from_secs(3600),
        ..TenantSettings::default()
    };
    let tm = Arc::new(TenantManager::new(dir, settings, Adapters::logging()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotwise".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_as(addr, "slotwise").await
}

/// Every login user shares the server password.
async fn connect_as(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("studio")
        .user(user)
        .password("slotwise");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a server error, got {err}"))
}

fn reserve_sql(slot: &str, occupancy: &str, user: &str) -> String {
    format!(
        "INSERT INTO reservations (catalog, program, date, start_time, end_time, occupancy, user_id) \
         VALUES ('live', 'Sunrise Yoga', {slot}, '{occupancy}', '{user}')"
    )
}

async fn setup_yoga(client: &tokio_postgres::Client, group_max: u32) {
    client
        .batch_execute(&format!(
            "INSERT INTO programs (catalog, title, mode, group_max) \
             VALUES ('live', 'Sunrise Yoga', 'online', {group_max})"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO slots (catalog, program, date, start_time, end_time) VALUES \
             ('live', 'Sunrise Yoga', {SLOT_0700}), ('live', 'Sunrise Yoga', {SLOT_0900})"
        ))
        .await
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn sunrise_yoga_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    setup_yoga(&client, 0).await;

    let first = rows(&client, &reserve_sql(SLOT_0700, "couple", "userA")).await;
    assert_eq!(first[0].get("booked_count"), Some("1"));
    assert_eq!(first[0].get("max_cap"), Some("2"));
    assert_eq!(first[0].get("locked_for"), Some("couple"));

    let second = rows(&client, &reserve_sql(SLOT_0700, "couple", "userB")).await;
    assert_eq!(second[0].get("booked_count"), Some("2"));

    assert_eq!(
        sqlstate(&client, &reserve_sql(SLOT_0700, "couple", "userC")).await,
        "53400"
    );

    let released = rows(
        &client,
        &format!(
            "DELETE FROM reservations WHERE catalog = 'live' AND program = 'Sunrise Yoga' \
             AND date = '2025-01-10' AND start_time = '07:00' AND end_time = '08:00' \
             AND occupancy = 'couple' AND user_id = 'userA'"
        ),
    )
    .await;
    assert_eq!(released[0].get("booked_count"), Some("1"));
    assert_eq!(released[0].get("locked_for"), Some("couple"));

    let slots = rows(
        &client,
        "SELECT * FROM slots WHERE catalog = 'live' AND program = 'Sunrise Yoga'",
    )
    .await;
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].get("start_time"), Some("07:00"));
    assert_eq!(slots[0].get("booked_count"), Some("1"));
    assert_eq!(slots[1].get("booked_count"), Some("0"));
    assert_eq!(slots[1].get("locked_for"), None);
}

#[tokio::test]
async fn rejections_map_to_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    setup_yoga(&client, 0).await;

    rows(&client, &reserve_sql(SLOT_0700, "couple", "userA")).await;
    // Locked for another type.
    assert_eq!(
        sqlstate(&client, &reserve_sql(SLOT_0700, "individual", "userB")).await,
        "55P03"
    );
    // Group size not configured.
    assert_eq!(
        sqlstate(&client, &reserve_sql(SLOT_0900, "group", "userB")).await,
        "55000"
    );
    // No such slot.
    assert_eq!(
        sqlstate(
            &client,
            &reserve_sql("'2025-01-11', '07:00', '08:00'", "couple", "userB")
        )
        .await,
        "P0002"
    );
    // Unknown occupancy label.
    assert_eq!(
        sqlstate(&client, &reserve_sql(SLOT_0900, "trio", "userB")).await,
        "22023"
    );
    // Missing or malformed fields are invalid arguments, not syntax errors.
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO reservations (catalog, program, date, start_time, end_time, occupancy) \
             VALUES ('live', 'Sunrise Yoga', '2025-01-10', '09:00', '10:00', 'couple')"
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(&client, &reserve_sql("'2025-01-32', '09:00', '10:00'", "couple", "userB")).await,
        "22023"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");
    // Program still has occupied slots.
    assert_eq!(
        sqlstate(
            &client,
            "DELETE FROM programs WHERE catalog = 'live' AND title = 'Sunrise Yoga'"
        )
        .await,
        "55000"
    );
}

#[tokio::test]
async fn group_booking_activates_at_threshold() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    setup_yoga(&client, 10).await;

    for user in ["u1", "u2"] {
        let booked = rows(
            &client,
            &format!(
                r#"INSERT INTO bookings (user_id, catalog, program, occupancy, slots, min_persons, waiting_period_end)
                   VALUES ('{user}', 'live', 'Sunrise Yoga', 'group',
                           '[{{"date":"2025-01-10","start":"07:00","end":"08:00"}}]', 2, '2025-01-05')"#
            ),
        )
        .await;
        assert_eq!(booked[0].get("status"), Some("waiting"));
    }

    let tick = rows(&client, "SELECT * FROM lifecycle_tick WHERE as_of = '2025-01-05'").await;
    assert_eq!(tick[0].get("activated"), Some("2"));
    assert_eq!(tick[0].get("refunded"), Some("0"));

    let active = rows(&client, "SELECT * FROM bookings WHERE status = 'active'").await;
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].get("actual_start_date"), Some("2025-01-05"));

    let done = rows(&client, "SELECT * FROM lifecycle_tick WHERE as_of = '2025-01-11'").await;
    assert_eq!(done[0].get("completed"), Some("2"));
}

#[tokio::test]
async fn grant_sweep_and_status() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(
            "INSERT INTO grants (user_id, program_id, expires_at) VALUES ('u', 'old', 1000); \
             INSERT INTO grants (user_id, program_id, expires_at) VALUES ('u', 'new', NULL)",
        )
        .await
        .unwrap();

    assert_eq!(
        sqlstate(&client, "SELECT * FROM sweep_expired WHERE secret = 'wrong'").await,
        "42501"
    );
    let sweep = rows(&client, "SELECT * FROM sweep_expired WHERE secret = 's3cret'").await;
    assert_eq!(sweep[0].get("deleted"), Some("1"));

    // Status is always for the login user.
    let owner = connect_as(addr, "u").await;
    let status = rows(&owner, "SELECT * FROM grant_status").await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].get("program_id"), Some("new"));
    assert_eq!(status[0].get("state"), Some("active"));
    let filtered = rows(&owner, "SELECT * FROM grant_status WHERE user_id = 'u'").await;
    assert_eq!(filtered.len(), 1);

    assert_eq!(
        sqlstate(&client, "SELECT * FROM grant_status WHERE user_id = 'u'").await,
        "42501"
    );
    assert!(rows(&client, "SELECT * FROM grant_status").await.is_empty());
}

#[tokio::test]
async fn retried_request_id_is_replayed() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    setup_yoga(&client, 0).await;

    let sql = "INSERT INTO reservations (catalog, program, date, start_time, end_time, occupancy, user_id, request_id) \
               VALUES ('live', 'Sunrise Yoga', '2025-01-10', '09:00', '10:00', 'individual', 'userA', 'req-1')";
    let first = rows(&client, sql).await;
    assert_eq!(first[0].get("booked_count"), Some("1"));
    assert_eq!(first[0].get("replayed"), Some("f"));

    let retry = rows(&client, sql).await;
    assert_eq!(retry[0].get("booked_count"), Some("1"));
    assert_eq!(retry[0].get("replayed"), Some("t"));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    setup_yoga(&client, 0).await;

    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other_studio")
        .user("slotwise")
        .password("slotwise");
    let (other, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    assert_eq!(rows(&client, "SELECT * FROM programs").await.len(), 1);
    assert!(rows(&other, "SELECT * FROM programs").await.is_empty());
}
