//! End-to-end behaviour of `Db` against a recording connection

use quarry_core::test_utils::MockConnection;
use quarry_core::{
    Column, ColumnType, Db, Error, Key, Model, Pagination, Record, Result, Rows, Sqlite, Value,
};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
struct User {
    key: Option<Key>,
    name: String,
    age: i64,
}

impl Model for User {
    fn kind() -> &'static str {
        "User"
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("Name", ColumnType::String),
            Column::new("Age", ColumnType::Int),
            Column::soft_delete(),
        ]
    }

    fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    fn set_key(&mut self, key: Key) -> Result<()> {
        self.key = Some(key);
        Ok(())
    }

    fn to_record(&self) -> Result<Record> {
        Ok(Record::new().with("Name", &self.name).with("Age", self.age))
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            key: record.key(),
            name: record.get_as("Name")?,
            age: record.get_as("Age")?,
        })
    }
}

fn setup() -> (Arc<MockConnection>, Db) {
    let conn = Arc::new(MockConnection::new());
    let db = Db::new("sqlite", "test", conn.clone(), Arc::new(Sqlite));
    (conn, db)
}

fn user_rows(users: &[(&str, &str, i64)]) -> Rows {
    Rows::new(
        vec!["$Key".into(), "Name".into(), "Age".into(), "$Deleted".into()],
        users
            .iter()
            .map(|(key, name, age)| {
                vec![
                    Value::from(*key),
                    Value::from(*name),
                    Value::Int(*age),
                    Value::Null,
                ]
            })
            .collect(),
    )
}

#[test]
fn test_query_renders_expected_statement() {
    let (conn, db) = setup();
    conn.respond(user_rows(&[("User,1", "ann", 30)]));

    let users: Vec<User> = db
        .query()
        .where_op("Age", ">", 18)
        .order_by("Name")
        .limit(10)
        .get()
        .unwrap();

    assert_eq!(users.len(), 1);
    assert_eq!(users[0].key, Some(Key::id("User", 1, None)));
    let (sql, args) = conn.queried().remove(0);
    assert_eq!(
        sql,
        "SELECT * FROM \"User\" WHERE \"Age\" > ? AND \"$Deleted\" IS NULL ORDER BY \"Name\" ASC LIMIT 10;"
    );
    assert_eq!(args, vec![Value::Int(18)]);
}

#[test]
fn test_find_missing_row_is_not_found() {
    let (_conn, db) = setup();
    let result = db.find::<User>(&Key::id("User", 404, None));
    assert_eq!(result, Err(Error::NotFound));
}

#[test]
fn test_create_then_soft_delete() {
    let (conn, db) = setup();
    let mut users = vec![
        User {
            name: "ann".into(),
            ..Default::default()
        },
        User {
            name: "bob".into(),
            ..Default::default()
        },
    ];
    db.create(&mut users).unwrap();
    assert!(users.iter().all(|u| u.key.is_some()));

    db.delete(&users).unwrap();
    let executed = conn.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(
        executed[1].0,
        "UPDATE \"User\" SET \"$Deleted\" = ? WHERE \"$Key\" IN (?,?);"
    );
    assert_eq!(executed[1].1.len(), 3);
    assert_eq!(
        executed[1].1[1],
        Value::String(users[0].key.as_ref().unwrap().encode())
    );
}

#[test]
fn test_bulk_update_rejects_key_before_execution() {
    let (conn, db) = setup();
    let mut values = BTreeMap::new();
    values.insert("__key__".to_string(), Value::from("User,1"));
    assert_eq!(
        db.table("User").update(values),
        Err(Error::KeyUpdateNotAllowed)
    );
    assert!(conn.log().is_empty());
}

#[test]
fn test_empty_in_list_never_reaches_connection() {
    let (conn, db) = setup();
    let result = db
        .query()
        .where_in("Name", Vec::<String>::new())
        .get::<User>();
    assert!(matches!(result, Err(Error::EmptyValueList { .. })));
    assert!(conn.log().is_empty());
}

#[test]
fn test_truncate_stops_at_first_failure() {
    let (conn, db) = setup();
    conn.fail_next("locked");
    let result = db.truncate(&["A", "B"]);
    assert!(matches!(result, Err(Error::Backend { .. })));
    assert_eq!(conn.log(), vec!["DELETE FROM \"A\";".to_string()]);
}

#[test]
fn test_pagination_walks_pages() {
    let (conn, db) = setup();
    let query = db.query().order_by("Name");

    conn.respond(user_rows(&[
        ("User,1", "ann", 30),
        ("User,2", "bob", 40),
        ("User,3", "cat", 50),
    ]));
    let mut page = Pagination::new(2);
    let first: Vec<User> = query.paginate(&mut page).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(page.count(), 2);
    assert!(page.advance());

    conn.respond(Rows::new(
        vec!["Name".into(), "$Key".into()],
        vec![vec![Value::from("bob"), Value::from("User,2")]],
    ));
    conn.respond(user_rows(&[("User,3", "cat", 50)]));
    let second: Vec<User> = query.paginate(&mut page).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].name, "cat");
    assert_eq!(page.next_cursor(), None);

    let queried = conn.queried();
    assert_eq!(queried.len(), 3);
    assert!(queried[0].0.ends_with("ORDER BY \"Name\" ASC,\"$Key\" ASC LIMIT 3;"));
    assert_eq!(
        queried[2].0,
        "SELECT * FROM \"User\" WHERE \"$Deleted\" IS NULL AND \
         ((\"Name\" > ?) OR (\"Name\" = ? AND \"$Key\" > ?)) \
         ORDER BY \"Name\" ASC,\"$Key\" ASC LIMIT 3;"
    );
    assert_eq!(
        queried[2].1,
        vec![
            Value::from("bob"),
            Value::from("bob"),
            Value::from("User,2")
        ]
    );
}

#[test]
fn test_cursor_from_other_query_is_rejected() {
    let (conn, db) = setup();
    conn.respond(user_rows(&[("User,1", "ann", 30), ("User,2", "bob", 40)]));
    let mut page = Pagination::new(1);
    db.query()
        .where_op("Age", ">", 18)
        .paginate::<User>(&mut page)
        .unwrap();
    let token = page.next_cursor().unwrap();

    let mut other = Pagination::new(1).with_cursor(token);
    let result = db
        .query()
        .where_op("Age", ">", 21)
        .paginate::<User>(&mut other);
    assert_eq!(result, Err(Error::InvalidCursor));
    assert_eq!(conn.queried().len(), 1);

    let mut forged = Pagination::new(1).with_cursor("not-a-cursor");
    assert_eq!(
        db.query().paginate::<User>(&mut forged),
        Err(Error::InvalidCursor)
    );
}

#[test]
fn test_transaction_commits_on_success() {
    let (conn, db) = setup();
    let value = db
        .run_in_transaction(|tx| {
            tx.exec("DELETE FROM \"User\";", &[])?;
            Ok(7)
        })
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(conn.log(), vec!["BEGIN", "DELETE FROM \"User\";", "COMMIT"]);
}

#[test]
fn test_transaction_rolls_back_on_error() {
    let (conn, db) = setup();
    let result: Result<()> = db.run_in_transaction(|tx| {
        tx.exec("DELETE FROM \"User\";", &[])?;
        Err(Error::NotFound)
    });
    assert_eq!(result, Err(Error::NotFound));
    assert_eq!(conn.log(), vec!["BEGIN", "DELETE FROM \"User\";", "ROLLBACK"]);
}

#[test]
fn test_transaction_rolls_back_on_panic() {
    let (conn, db) = setup();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = db.run_in_transaction(|tx| -> Result<()> {
            tx.exec("DELETE FROM \"User\";", &[])?;
            panic!("boom");
        });
    }));
    assert!(outcome.is_err());
    assert_eq!(conn.log(), vec!["BEGIN", "DELETE FROM \"User\";", "ROLLBACK"]);
}

#[test]
fn test_failed_commit_rolls_back() {
    let (conn, db) = setup();
    conn.fail_commit("serialization failure");
    let result = db.run_in_transaction(|_| Ok(()));
    assert!(matches!(result, Err(Error::Backend { ref operation, .. }) if operation == "commit"));
    assert_eq!(conn.log(), vec!["BEGIN", "COMMIT FAILED", "ROLLBACK"]);
}

#[test]
fn test_transaction_unsupported() {
    let conn = Arc::new(MockConnection::without_transactions());
    let db = Db::new("sqlite", "test", conn.clone(), Arc::new(Sqlite));
    let mut ran = false;
    let result = db.run_in_transaction(|_| {
        ran = true;
        Ok(())
    });
    assert_eq!(result, Err(Error::TransactionUnsupported));
    assert!(!ran);
}
