/*!
 * SQL shape tests for Mongora
 * One test per renderer shape: merge, unions, buckets, laterals, wraps
 */

use anyhow::Result;
use bson::{doc, Bson};
use mongora::{MongoraError, TranslateOptions, Translator, TranslatorConfig};

fn translator(collection: &str) -> Translator {
    Translator::new(TranslatorConfig::new(collection)).unwrap()
}

fn strict(collection: &str) -> Translator {
    Translator::new(TranslatorConfig::new(collection))
        .unwrap()
        .with_options(TranslateOptions::strict())
}

#[test]
fn merge_emits_policy_clauses() -> Result<()> {
    let stages = vec![
        doc! { "$match": { "status": "done" } },
        doc! { "$merge": {
            "into": "summary",
            "on": "region",
            "whenMatched": "replace",
            "whenNotMatched": "insert"
        }},
    ];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "MERGE INTO summary tgt USING (SELECT base.data FROM orders base WHERE base.data.status = :1) src \
         ON (tgt.data.region = src.data.region) \
         WHEN MATCHED THEN UPDATE SET tgt.data = src.data \
         WHEN NOT MATCHED THEN INSERT (data) VALUES (src.data)"
    );
    Ok(())
}

#[test]
fn merge_policies_vary_clauses() -> Result<()> {
    let stages = vec![doc! { "$merge": {
        "into": "summary",
        "whenMatched": "merge",
        "whenNotMatched": "discard"
    }}];
    let result = translator("orders").translate(&stages)?;
    assert!(result
        .sql
        .contains("UPDATE SET tgt.data = JSON_MERGEPATCH(tgt.data, src.data)"));
    assert!(!result.sql.contains("WHEN NOT MATCHED"));
    // default on-field is _id, which requires quoting
    assert!(result.sql.contains("ON (tgt.data.\"_id\" = src.data.\"_id\")"));
    Ok(())
}

#[test]
fn merge_fail_policy_is_rejected_in_strict_mode() {
    let stages = vec![doc! { "$merge": { "into": "summary", "whenMatched": "fail" } }];
    let err = strict("orders").translate(&stages).unwrap_err();
    assert!(matches!(err, MongoraError::UnsupportedOperator(_)));
}

#[test]
fn union_branches_append_with_union_all() -> Result<()> {
    let stages = vec![
        doc! { "$match": { "year": 2024 } },
        doc! { "$unionWith": { "coll": "archive", "pipeline": [ { "$match": { "year": 2023 } } ] } },
    ];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data FROM orders base WHERE base.data.year = :1 \
         UNION ALL SELECT base.data FROM archive base WHERE base.data.year = :2"
    );
    assert_eq!(result.binds, vec![Bson::Int32(2024), Bson::Int32(2023)]);
    Ok(())
}

#[test]
fn group_after_union_wraps_branches() -> Result<()> {
    let stages = vec![
        doc! { "$unionWith": "archive" },
        doc! { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } },
    ];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT u.region AS \"_id\", SUM(u.amount) AS total FROM (\
         SELECT base.data AS data, base.data.region AS region, base.data.amount AS amount FROM orders base \
         UNION ALL \
         SELECT base.data AS data, base.data.region AS region, base.data.amount AS amount FROM archive base\
         ) u GROUP BY u.region"
    );
    Ok(())
}

#[test]
fn bucket_renders_boundary_case() -> Result<()> {
    let stages = vec![doc! { "$bucket": {
        "groupBy": "$price",
        "boundaries": [0, 100, 500],
        "default": "Other",
        "output": { "n": { "$sum": 1 } }
    }}];
    let result = translator("products").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT CASE \
         WHEN base.data.price >= 0 AND base.data.price < 100 THEN 0 \
         WHEN base.data.price >= 100 AND base.data.price < 500 THEN 100 \
         ELSE 'Other' END AS \"_id\", COUNT(*) AS n \
         FROM products base \
         GROUP BY CASE \
         WHEN base.data.price >= 0 AND base.data.price < 100 THEN 0 \
         WHEN base.data.price >= 100 AND base.data.price < 500 THEN 100 \
         ELSE 'Other' END"
    );
    // boundaries render inline, never as binds
    assert!(result.binds.is_empty());
    Ok(())
}

#[test]
fn bucket_auto_uses_ntile() -> Result<()> {
    let stages = vec![doc! { "$bucketAuto": { "groupBy": "$price", "buckets": 4 } }];
    let result = translator("products").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_OBJECT('min' VALUE MIN(t1.bucket_val), 'max' VALUE MAX(t1.bucket_val)) AS \"_id\", COUNT(*) AS count \
         FROM (SELECT base.id AS id, base.data AS data, base.data.price AS bucket_val, \
         NTILE(4) OVER (ORDER BY base.data.price) AS bucket_id FROM products base) t1 \
         GROUP BY t1.bucket_id \
         ORDER BY t1.bucket_id"
    );
    Ok(())
}

#[test]
fn graph_lookup_depth_zero_is_a_lateral() -> Result<()> {
    let stages = vec![doc! { "$graphLookup": {
        "from": "employees",
        "startWith": "$managerId",
        "connectFromField": "managerId",
        "connectToField": "email",
        "as": "manager",
        "maxDepth": 0
    }}];
    let result = translator("employees").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data, t1.data AS manager \
         FROM employees base \
         LEFT OUTER JOIN LATERAL (SELECT JSON_ARRAYAGG(t2.data) AS data FROM employees t2 \
         WHERE t2.data.email = base.data.managerId) t1 ON (1=1)"
    );
    Ok(())
}

#[test]
fn recursive_graph_lookup_renders_empty_lateral() -> Result<()> {
    let stages = vec![doc! { "$graphLookup": {
        "from": "employees",
        "startWith": "$managerId",
        "connectFromField": "managerId",
        "connectToField": "email",
        "as": "chain"
    }}];
    let result = translator("employees").translate(&stages)?;
    assert!(result
        .sql
        .contains("LEFT OUTER JOIN LATERAL (SELECT JSON_ARRAY() AS data FROM DUAL)"));

    let err = strict("employees").translate(&stages).unwrap_err();
    assert!(matches!(err, MongoraError::UnsupportedOperator(_)));
    Ok(())
}

#[test]
fn redact_appends_prune_filter_after_matches() -> Result<()> {
    let stages = vec![
        doc! { "$match": { "level": { "$gte": 2 } } },
        doc! { "$redact": { "$cond": { "if": { "$gte": ["$level", 5] }, "then": "$$PRUNE", "else": "$$KEEP" } } },
    ];
    let result = translator("docs").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data FROM docs base \
         WHERE base.data.level >= :1 AND \
         CASE WHEN base.data.level >= :2 THEN '$$PRUNE' ELSE '$$KEEP' END != '$$PRUNE'"
    );
    Ok(())
}

#[test]
fn sample_orders_by_random() -> Result<()> {
    let stages = vec![doc! { "$sample": { "size": 3 } }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data FROM orders base ORDER BY DBMS_RANDOM.VALUE FETCH FIRST 3 ROWS ONLY"
    );
    Ok(())
}

#[test]
fn count_stage_aliases_count_star() -> Result<()> {
    let stages = vec![doc! { "$count": "total" }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(result.sql, "SELECT COUNT(*) AS total FROM orders base");
    Ok(())
}

#[test]
fn replace_root_projects_subtree() -> Result<()> {
    let stages = vec![doc! { "$replaceRoot": { "newRoot": "$customer" } }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_QUERY(base.data, '$.customer') AS data FROM orders base"
    );
    Ok(())
}

#[test]
fn replace_root_with_inline_object() -> Result<()> {
    let stages = vec![doc! { "$replaceRoot": { "newRoot": { "name": "$name", "city": "$address.city" } } }];
    let result = translator("customers").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_OBJECT('name' VALUE JSON_QUERY(base.data, '$.name'), \
         'city' VALUE JSON_QUERY(base.data, '$.address.city')) AS data FROM customers base"
    );
    Ok(())
}

#[test]
fn add_fields_before_replace_root_feeds_the_new_root() -> Result<()> {
    let stages = vec![
        doc! { "$addFields": { "wrapped": { "name": "$name" } } },
        doc! { "$replaceRoot": { "newRoot": "$wrapped" } },
    ];
    let result = translator("customers").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_OBJECT('name' VALUE JSON_QUERY(base.data, '$.name')) AS data FROM customers base"
    );
    Ok(())
}

#[test]
fn add_fields_after_replace_root_is_rejected() {
    let stages = vec![
        doc! { "$replaceRoot": { "newRoot": "$detail" } },
        doc! { "$addFields": { "flag": 1 } },
    ];
    let err = translator("orders").translate(&stages).unwrap_err();
    assert!(
        matches!(err, MongoraError::UnsupportedOperator(ref t) if t.contains("$addFields")),
        "unexpected error: {}",
        err
    );
}

#[test]
fn window_fields_with_replace_root_are_rejected() {
    let stages = vec![
        doc! { "$setWindowFields": {
            "sortBy": { "ts": 1 },
            "output": { "rank": { "$rank": {} } }
        }},
        doc! { "$replaceRoot": { "newRoot": "$detail" } },
    ];
    let err = translator("orders").translate(&stages).unwrap_err();
    assert!(matches!(err, MongoraError::UnsupportedOperator(_)));
}

#[test]
fn unset_removes_paths() -> Result<()> {
    let stages = vec![doc! { "$unset": ["secret", "audit.trace"] }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_TRANSFORM(base.data, REMOVE '$.secret', REMOVE '$.audit.trace') AS data FROM orders base"
    );
    Ok(())
}

#[test]
fn add_fields_appends_computed_columns() -> Result<()> {
    let stages = vec![doc! { "$addFields": { "total": { "$add": ["$a", "$b"] } } }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data, (base.data.a + base.data.b) AS total FROM orders base"
    );
    Ok(())
}

#[test]
fn set_is_an_alias_for_add_fields() -> Result<()> {
    let a = translator("orders")
        .translate(&[doc! { "$addFields": { "x": 1 } }])?;
    let b = translator("orders").translate(&[doc! { "$set": { "x": 1 } }])?;
    assert_eq!(a.sql, b.sql);
    Ok(())
}

#[test]
fn add_fields_after_group_wraps_inner_query() -> Result<()> {
    let stages = vec![
        doc! { "$group": { "_id": "$cat", "total": { "$sum": "$amt" } } },
        doc! { "$addFields": { "doubled": { "$multiply": ["$total", 2] } } },
        doc! { "$sort": { "total": -1 } },
        doc! { "$limit": 10 },
    ];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT inner_query.*, (inner_query.total * :1) AS doubled \
         FROM (SELECT base.data.cat AS \"_id\", SUM(base.data.amt) AS total \
         FROM orders base \
         GROUP BY base.data.cat) inner_query \
         ORDER BY total DESC \
         FETCH FIRST 10 ROWS ONLY"
    );
    Ok(())
}

#[test]
fn window_without_post_match_stays_inline() -> Result<()> {
    let stages = vec![doc! { "$setWindowFields": {
        "partitionBy": "$cat",
        "sortBy": { "ts": 1 },
        "output": {
            "running": { "$sum": "$amt", "window": { "documents": ["unbounded", "current"] } }
        }
    }}];
    let result = translator("sales").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data, SUM(base.data.amt) OVER (PARTITION BY base.data.cat \
         ORDER BY base.data.ts ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) AS running \
         FROM sales base"
    );
    Ok(())
}

#[test]
fn unwind_emits_json_table_and_resolves_paths() -> Result<()> {
    let stages = vec![
        doc! { "$unwind": "$items" },
        doc! { "$match": { "items.qty": { "$gte": 2 } } },
    ];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data \
         FROM orders base, JSON_TABLE(base.data, '$.items[*]' COLUMNS (data JSON PATH '$')) t1 \
         WHERE t1.data.qty >= :1"
    );
    Ok(())
}

#[test]
fn unwind_preserve_uses_outer_apply() -> Result<()> {
    let stages = vec![doc! { "$unwind": {
        "path": "$items",
        "preserveNullAndEmptyArrays": true,
        "includeArrayIndex": "idx"
    }}];
    let result = translator("orders").translate(&stages)?;
    assert!(result.sql.contains(
        "OUTER APPLY JSON_TABLE(base.data, '$.items[*]' COLUMNS (data JSON PATH '$', idx FOR ORDINALITY)) t1"
    ));
    Ok(())
}

#[test]
fn pipeline_lookup_renders_lateral_aggregation() -> Result<()> {
    let stages = vec![doc! { "$lookup": {
        "from": "orders",
        "let": { "cid": "$email" },
        "pipeline": [ { "$match": { "$expr": { "$eq": ["$customerId", "$$cid"] } } } ],
        "as": "orders_list"
    }}];
    let result = translator("customers").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data \
         FROM customers base \
         LEFT OUTER JOIN LATERAL (SELECT JSON_ARRAYAGG(t2.data) AS data FROM orders t2 \
         WHERE t2.data.customerId = base.data.email) t1 ON (1=1)"
    );
    Ok(())
}

#[test]
fn size_on_lookup_field_consumes_the_join() -> Result<()> {
    let stages = vec![
        doc! { "$lookup": {
            "from": "reviews",
            "localField": "sku",
            "foreignField": "sku",
            "as": "reviews"
        }},
        doc! { "$project": { "reviewCount": { "$size": "$reviews" } } },
    ];
    let result = translator("products").translate(&stages)?;
    assert!(result.sql.contains(
        "(SELECT COUNT(*) FROM reviews t2 WHERE t2.data.sku = base.data.sku) AS \"reviewCount\""
    ));
    assert!(!result.sql.contains("LEFT OUTER JOIN"));
    Ok(())
}

#[test]
fn projection_wraps_rows_into_json_array() -> Result<()> {
    let stages = vec![doc! { "$project": { "name": 1, "total": "$amount" } }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_ARRAYAGG(JSON_OBJECT(*) RETURNING CLOB) \
         FROM (SELECT JSON_QUERY(base.data, '$.name') AS name, \
         JSON_QUERY(base.data, '$.amount') AS total FROM orders base)"
    );
    Ok(())
}

#[test]
fn exclusion_projection_uses_json_transform() -> Result<()> {
    let stages = vec![doc! { "$project": { "secret": 0 } }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT JSON_TRANSFORM(base.data, REMOVE '$.secret') AS data FROM orders base"
    );
    Ok(())
}

#[test]
fn sort_by_count_desugars_to_group_and_sort() -> Result<()> {
    let stages = vec![doc! { "$sortByCount": "$category" }];
    let result = translator("orders").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data.category AS \"_id\", COUNT(*) AS count \
         FROM orders base \
         GROUP BY base.data.category \
         ORDER BY count DESC"
    );
    Ok(())
}

#[test]
fn compound_group_key_gets_one_alias_per_field() -> Result<()> {
    let stages = vec![doc! { "$group": {
        "_id": { "state": "$state", "city": "$city" },
        "n": { "$sum": 1 }
    }}];
    let result = translator("customers").translate(&stages)?;
    assert_eq!(
        result.sql,
        "SELECT base.data.state AS state, base.data.city AS city, COUNT(*) AS n \
         FROM customers base \
         GROUP BY base.data.state, base.data.city"
    );
    Ok(())
}

#[test]
fn first_and_last_accumulators_keep_identity_order() -> Result<()> {
    let stages = vec![doc! { "$group": {
        "_id": "$cat",
        "earliest": { "$first": "$ts" },
        "latest": { "$last": "$ts" }
    }}];
    let result = translator("events").translate(&stages)?;
    assert!(result
        .sql
        .contains("MIN(base.data.ts) KEEP (DENSE_RANK FIRST ORDER BY base.id) AS earliest"));
    assert!(result
        .sql
        .contains("MAX(base.data.ts) KEEP (DENSE_RANK LAST ORDER BY base.id) AS latest"));
    Ok(())
}

#[test]
fn out_with_target_database_qualifies_table() -> Result<()> {
    let stages = vec![doc! { "$out": { "db": "reporting", "coll": "archive" } }];
    let result = translator("orders").translate(&stages)?;
    assert!(result.sql.starts_with("INSERT INTO reporting.archive (data) "));
    Ok(())
}
