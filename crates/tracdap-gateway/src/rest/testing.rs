//! Hand-built descriptor pool used by the REST mapper tests.
//!
//! Mirrors the shape of the metadata API closely enough to exercise path
//! variables, nested messages, enums, numeric captures, bytes downloads and
//! streaming responses, without requiring protoc at test time.

use http::Method;
use prost_reflect::DescriptorPool;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto, ServiceDescriptorProto,
};

use crate::rest::rule::HttpRule;

fn field(
    name: &str,
    json_name: &str,
    number: i32,
    kind: Type,
    type_name: Option<&str>,
    label: Label,
) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        json_name: Some(json_name.to_string()),
        number: Some(number),
        r#type: Some(kind as i32),
        type_name: type_name.map(str::to_string),
        label: Some(label as i32),
        ..Default::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn method(name: &str, input: &str, output: &str, server_streaming: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(input.to_string()),
        output_type: Some(output.to_string()),
        server_streaming: Some(server_streaming),
        ..Default::default()
    }
}

/// Build the test pool: one file, one service, a handful of messages.
pub fn metadata_pool() -> DescriptorPool {
    let object_type = EnumDescriptorProto {
        name: Some("ObjectType".to_string()),
        value: vec![
            EnumValueDescriptorProto {
                name: Some("OBJECT_TYPE_NOT_SET".to_string()),
                number: Some(0),
                ..Default::default()
            },
            EnumValueDescriptorProto {
                name: Some("DATA".to_string()),
                number: Some(1),
                ..Default::default()
            },
            EnumValueDescriptorProto {
                name: Some("MODEL".to_string()),
                number: Some(2),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    let read_object_request = message(
        "ReadObjectRequest",
        vec![
            field("tenant", "tenant", 1, Type::String, None, Label::Optional),
            field("object_id", "objectId", 2, Type::String, None, Label::Optional),
            field("version", "version", 3, Type::Int32, None, Label::Optional),
            field("search_text", "searchText", 4, Type::String, None, Label::Optional),
            field("tags", "tags", 5, Type::String, None, Label::Repeated),
            field(
                "object_type",
                "objectType",
                6,
                Type::Enum,
                Some(".tracdap.test.ObjectType"),
                Label::Optional,
            ),
        ],
    );

    let read_version_request = message(
        "ReadVersionRequest",
        vec![
            field("tenant", "tenant", 1, Type::String, None, Label::Optional),
            field("object_version", "objectVersion", 2, Type::Int32, None, Label::Optional),
        ],
    );

    let object_definition = message(
        "ObjectDefinition",
        vec![
            field("schema", "schema", 1, Type::String, None, Label::Optional),
            field("format", "format", 2, Type::String, None, Label::Optional),
        ],
    );

    let save_object_request = message(
        "SaveObjectRequest",
        vec![
            field("tenant", "tenant", 1, Type::String, None, Label::Optional),
            field(
                "definition",
                "definition",
                2,
                Type::Message,
                Some(".tracdap.test.ObjectDefinition"),
                Label::Optional,
            ),
            field("format", "format", 3, Type::String, None, Label::Optional),
        ],
    );

    let tag = message(
        "Tag",
        vec![
            field("object_id", "objectId", 1, Type::String, None, Label::Optional),
            field("version", "version", 2, Type::Int32, None, Label::Optional),
        ],
    );

    let file_chunk = message(
        "FileChunk",
        vec![field("content", "content", 1, Type::Bytes, None, Label::Optional)],
    );

    let service = ServiceDescriptorProto {
        name: Some("MetadataService".to_string()),
        method: vec![
            method(
                "ReadObject",
                ".tracdap.test.ReadObjectRequest",
                ".tracdap.test.Tag",
                false,
            ),
            method(
                "ReadVersion",
                ".tracdap.test.ReadVersionRequest",
                ".tracdap.test.Tag",
                false,
            ),
            method(
                "SaveObject",
                ".tracdap.test.SaveObjectRequest",
                ".tracdap.test.Tag",
                false,
            ),
            method(
                "ReadFile",
                ".tracdap.test.ReadObjectRequest",
                ".tracdap.test.FileChunk",
                true,
            ),
            method(
                "SearchObjects",
                ".tracdap.test.ReadObjectRequest",
                ".tracdap.test.Tag",
                true,
            ),
        ],
        ..Default::default()
    };

    let file = FileDescriptorProto {
        name: Some("tracdap/test/metadata.proto".to_string()),
        package: Some("tracdap.test".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            read_object_request,
            read_version_request,
            object_definition,
            save_object_request,
            tag,
            file_chunk,
        ],
        enum_type: vec![object_type],
        service: vec![service],
        ..Default::default()
    };

    DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
        .expect("test descriptor pool is well-formed")
}

/// Shorthand for an [`HttpRule`] with no additional bindings.
pub fn rule(http_method: Method, template: &str, body: &str, response_body: &str) -> HttpRule {
    HttpRule {
        http_method,
        template: template.to_string(),
        body: body.to_string(),
        response_body: response_body.to_string(),
        download: false,
        additional: Vec::new(),
    }
}
