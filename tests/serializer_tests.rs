//! Reference-resolving serializer: references travel as ids and resolve on read

use memento_rebind::{
    BasicEntity, BasicLocation, DeferredValue, EncodingFormat, EntityMemento, EntityRef,
    GraphMemento, LocationMemento, LocationRef, Memento, MementoDelta, MementoSerializer,
    MementoValue, PlaceholderLookup, PolicyMemento, SerializerConfig, StaticLookup, TypeAliases,
};

fn peer_lookup() -> (StaticLookup, EntityRef, LocationRef) {
    let peer = EntityRef::to(BasicEntity::with_id("db", "org.example.Database"));
    let region = LocationRef::to(BasicLocation::with_id("eu-1", "org.example.Region"));
    let lookup = StaticLookup::new()
        .with_entity(peer.clone())
        .with_location(region.clone());
    (lookup, peer, region)
}

#[test]
fn test_entity_references_resolve_to_lookup_handles() {
    let (lookup, peer, region) = peer_lookup();
    let memento = EntityMemento::builder("web", "org.example.WebApp")
        .display_name("web tier")
        .config("database", peer.clone())
        .config("replicas", 3i64)
        .attribute("region", region.clone())
        .attribute(
            "endpoints",
            MementoValue::List(vec!["a".into(), MementoValue::Entity(peer.clone())]),
        )
        .build();

    for serializer in [MementoSerializer::json(), MementoSerializer::message_pack()] {
        let bytes = serializer.encode_entity(&memento).unwrap();
        let decoded = serializer.decode_entity(&bytes, &lookup).unwrap();

        assert_eq!(decoded, memento);
        let database = decoded.config()["database"].as_entity().unwrap();
        assert!(database.same_slot(&peer));
        assert!(database.is_built());
        let decoded_region = decoded.attributes()["region"].as_location().unwrap();
        assert!(decoded_region.same_slot(&region));
    }
}

#[test]
fn test_references_are_written_as_ids_only() {
    let (_, peer, _) = peer_lookup();
    let memento = EntityMemento::builder("web", "org.example.WebApp")
        .config("database", peer)
        .build();

    let bytes = MementoSerializer::json().encode_entity(&memento).unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains(
        r#"{"type":"entityRef","value":{"id":"db","expectedType":"org.example.Database"}}"#
    ));
}

#[test]
fn test_missing_reference_fails_with_no_such_object() {
    let (_, peer, _) = peer_lookup();
    let memento = EntityMemento::builder("web", "org.example.WebApp")
        .config("database", peer)
        .build();
    let serializer = MementoSerializer::json();
    let bytes = serializer.encode_entity(&memento).unwrap();

    let err = serializer
        .decode_entity(&bytes, &StaticLookup::new())
        .unwrap_err();
    assert!(err.is_no_such_object());
}

#[test]
fn test_placeholder_lookup_collects_referenced_ids() {
    let (_, peer, region) = peer_lookup();
    let memento = EntityMemento::builder("web", "org.example.WebApp")
        .config("database", peer)
        .config("region", region)
        .build();
    let serializer = MementoSerializer::json();
    let bytes = serializer.encode_entity(&memento).unwrap();

    let lookup = PlaceholderLookup::new();
    let decoded = serializer.decode_entity(&bytes, &lookup).unwrap();

    assert_eq!(lookup.entity_ids(), vec!["db".to_string()]);
    assert_eq!(lookup.location_ids(), vec!["eu-1".to_string()]);
    assert!(!decoded.config()["database"].as_entity().unwrap().is_built());
}

#[test]
fn test_aliases_shorten_type_names_on_the_wire() {
    let aliases = TypeAliases::new()
        .with_alias("org.example.WebApp", "web")
        .with_alias("org.example.Region", "region");
    let serializer = MementoSerializer::new(SerializerConfig::default().with_aliases(aliases));

    let entity = EntityMemento::builder("w1", "org.example.WebApp").build();
    let location = LocationMemento::builder("l1", "org.example.Region").build();
    let policy = PolicyMemento::builder("p1", "org.example.AutoScaler")
        .flag("min", 1i64)
        .build();

    let bytes = serializer.encode_entity(&entity).unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(!text.contains("org.example.WebApp"));
    assert_eq!(
        serializer.decode_entity(&bytes, &StaticLookup::new()).unwrap(),
        entity
    );

    let bytes = serializer.encode_location(&location).unwrap();
    assert_eq!(
        serializer
            .decode_location(&bytes, &StaticLookup::new())
            .unwrap()
            .type_name(),
        "org.example.Region"
    );

    // No alias registered: the full name is written and read back.
    let bytes = serializer.encode_policy(&policy).unwrap();
    assert_eq!(
        serializer.decode_policy(&bytes, &StaticLookup::new()).unwrap(),
        policy
    );
}

#[test]
fn test_unsettled_deferred_values_are_omitted() {
    let pending = DeferredValue::pending();
    let failed = DeferredValue::pending();
    failed.fail("resolver crashed");
    let memento = EntityMemento::builder("e1", "App")
        .config("ready", DeferredValue::resolved("yes"))
        .config("pending", pending)
        .config("failed", failed)
        .build();

    let serializer = MementoSerializer::json();
    let bytes = serializer.encode_entity(&memento).unwrap();
    let decoded = serializer.decode_entity(&bytes, &StaticLookup::new()).unwrap();

    let keys: Vec<_> = decoded.config().keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["ready"]);
    assert_eq!(decoded.config()["ready"].as_str(), Some("yes"));
}

#[test]
fn test_delta_and_checkpoint_documents() {
    let serializer = MementoSerializer::new(
        SerializerConfig::default().with_format(EncodingFormat::MessagePack),
    );

    let mut delta = MementoDelta::new();
    delta.entities.push(EntityMemento::builder("e1", "App").build());
    delta.removed_location_ids.insert("gone".to_string());
    let bytes = serializer.encode_delta(&delta).unwrap();
    assert_eq!(
        serializer.decode_delta(&bytes, &StaticLookup::new()).unwrap(),
        delta
    );

    let mut graph = GraphMemento::new();
    graph.insert_entity(EntityMemento::builder("e1", "App").build());
    graph.insert_location(LocationMemento::builder("l1", "Region").build());
    let bytes = serializer.encode_checkpoint(&graph).unwrap();
    assert_eq!(
        serializer.decode_graph(&bytes, &StaticLookup::new()).unwrap(),
        graph
    );
    assert!(serializer.decode_delta(&bytes, &StaticLookup::new()).is_err());
}

#[test]
fn test_format_names_parse() {
    assert_eq!("json".parse::<EncodingFormat>().unwrap(), EncodingFormat::Json);
    assert_eq!(
        "msgpack".parse::<EncodingFormat>().unwrap(),
        EncodingFormat::MessagePack
    );
    assert!("yaml".parse::<EncodingFormat>().is_err());
}
