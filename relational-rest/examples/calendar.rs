//! A small calendar service: events carrying tags and types, tags forming a hierarchy.
//!
//! Seeds a mock database and answers request URIs against it, e.g.:
//!
//! ```text
//! cargo run --example calendar --features examples -- \
//!     --role user "/event/+/event.summary,tag.name?tag.name.like=b%25"
//! ```

use clap::Parser;
use relational_rest::{
    init_logging,
    prelude::*,
    sql::db::mock,
};
use serde_json::json;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Schema
//

pub fn schema() -> Schema {
    Schema::builder()
        .resource(
            "event",
            "id",
            [
                ("id", FieldType::Serial),
                ("summary", FieldType::Text),
                ("description", FieldType::Text),
                ("time", FieldType::Timestamp),
            ],
        )
        .resource(
            "type",
            "id",
            [("id", FieldType::Serial), ("name", FieldType::Text)],
        )
        .resource(
            "tag",
            "id",
            [
                ("id", FieldType::Serial),
                ("name", FieldType::Text),
                ("color", FieldType::Text),
                ("parent_id", FieldType::BigInt),
            ],
        )
        .relationship(
            "type",
            "event",
            "type",
            Cardinality::ManyToMany,
            JoinKeys::Via {
                table: "nn_event_type".into(),
                source_column: "event_id".into(),
                target_column: "type_id".into(),
            },
        )
        .relationship(
            "tag",
            "event",
            "tag",
            Cardinality::ManyToMany,
            JoinKeys::Via {
                table: "nn_event_tag".into(),
                source_column: "event_id".into(),
                target_column: "tag_id".into(),
            },
        )
        .relationship(
            "event",
            "tag",
            "event",
            Cardinality::ManyToMany,
            JoinKeys::Via {
                table: "nn_event_tag".into(),
                source_column: "tag_id".into(),
                target_column: "event_id".into(),
            },
        )
        .relationship(
            "parent",
            "tag",
            "tag",
            Cardinality::OneToMany,
            JoinKeys::Direct {
                source_column: "parent_id".into(),
                target_column: "id".into(),
            },
        )
        .build()
        .unwrap()
}

pub fn visibility(schema: &Schema) -> VisibilityTable {
    VisibilityTable::builder(schema)
        .allow("admin", "*", ["*"])
        .allow("user", "event", ["*"])
        .allow("user", "tag", ["id", "name"])
        .allow(EVERYONE, "type", ["id", "name"])
        .build()
        .unwrap()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Demo data
//

pub async fn service() -> Service<mock::Connection> {
    let schema = schema();
    let visibility = visibility(&schema);
    let service = Service::new(
        mock::Connection::create(),
        schema,
        visibility,
        Config::default(),
    );
    service.provision().await.unwrap();

    let record = |value: serde_json::Value| value.as_object().unwrap().clone();
    let seed = [
        ("tag", json!({"name": "billiards", "color": "green"})),
        ("tag", json!({"name": "books", "color": "blue"})),
        ("tag", json!({"name": "bestsellers", "parent_id": 2})),
        ("type", json!({"name": "leisure"})),
        ("type", json!({"name": "work"})),
        (
            "event",
            json!({
                "summary": "pool night",
                "description": "bring your own cue",
                "time": "1999-05-01T20:00:00",
            }),
        ),
        (
            "event",
            json!({"summary": "book club", "time": "2001-06-01T18:00:00"}),
        ),
        (
            "event",
            json!({"summary": "inventory", "time": "2001-09-15T09:00:00"}),
        ),
    ];
    for (resource, fields) in seed {
        service
            .create(resource, &record(fields), "admin")
            .await
            .unwrap();
    }

    // The link tables have no resource of their own; populate them directly.
    use relational_rest::sql::db::{Connection as _, Insert as _, Value};
    let db = service.db();
    db.insert("nn_event_tag", ["event_id", "tag_id"])
        .rows([
            vec![Value::Int8(1), Value::Int8(1)],
            vec![Value::Int8(2), Value::Int8(2)],
            vec![Value::Int8(2), Value::Int8(3)],
        ])
        .execute()
        .await
        .unwrap();
    db.insert("nn_event_type", ["event_id", "type_id"])
        .rows([
            vec![Value::Int8(1), Value::Int8(1)],
            vec![Value::Int8(2), Value::Int8(1)],
            vec![Value::Int8(3), Value::Int8(2)],
        ])
        .execute()
        .await
        .unwrap();

    service
}

////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// The role to read as.
    #[clap(long, default_value = "admin")]
    role: String,
    /// Request URIs to answer; a default tour runs if none are given.
    uris: Vec<String>,
}

#[async_std::main]
async fn main() {
    init_logging();
    let opt = Options::parse();
    let service = service().await;

    let tour = [
        "/event".to_string(),
        "/event/1/tag".to_string(),
        "/tag/+/+".to_string(),
        "/event/+/+/event.summary,tag.name?event.time.lt=2000-01-01".to_string(),
    ];
    let uris = if opt.uris.is_empty() {
        tour.to_vec()
    } else {
        opt.uris
    };

    for uri in uris {
        println!("GET {uri} (as {})", opt.role);
        match service.read(&uri, &opt.role).await {
            Ok(graph) => println!("{}\n", serde_json::to_string_pretty(&graph).unwrap()),
            Err(err) => println!("{} {}: {err}\n", err.status(), err.code()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_demo_tour() {
        init_logging();
        let service = service().await;

        let graph = service
            .read("/event/+/+/event.summary,tag.name?event.time.lt=2000-01-01", "admin")
            .await
            .unwrap();
        let summaries = graph
            .records
            .iter()
            .filter(|r| r.resource == "event")
            .map(|r| r.fields["summary"].clone())
            .collect::<Vec<_>>();
        assert_eq!(summaries, [serde_json::json!("pool night")]);
    }

    #[async_std::test]
    async fn test_roles_see_different_fields() {
        init_logging();
        let service = service().await;

        let admin = service.read("/tag/1", "admin").await.unwrap();
        assert!(admin.records[0].fields.contains_key("color"));

        let user = service.read("/tag/1", "user").await.unwrap();
        assert!(!user.records[0].fields.contains_key("color"));
    }
}
