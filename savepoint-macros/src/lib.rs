use darling::{FromDeriveInput, FromField, FromMeta};
use heck::ToKebabCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::{DeriveInput, GenericArgument, Ident, Path, PathArguments, parse_macro_input};

/// Parse `key = Type` meta items into a `syn::Type`.
fn parse_name_value_type(item: &syn::Meta) -> darling::Result<syn::Type> {
    let error = || darling::Error::unsupported_shape("expected `key = Type`");
    let syn::Meta::NameValue(nv) = item else {
        return Err(error());
    };
    syn::parse2(nv.value.to_token_stream()).map_err(|_| error())
}

/// Returns the kind override or the default kebab-case name from the ident.
fn default_kind(ident: &Ident, kind: Option<String>) -> String {
    kind.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Wrapper for `syn::Path` that parses from `key = Type` syntax.
#[derive(Debug, Clone)]
struct TypePath(Path);

impl FromMeta for TypePath {
    fn from_meta(item: &syn::Meta) -> darling::Result<Self> {
        let ty = parse_name_value_type(item)?;
        match ty {
            syn::Type::Path(type_path) if type_path.qself.is_none() => Ok(Self(type_path.path)),
            _ => Err(darling::Error::unsupported_shape("expected `key = Type`")),
        }
    }
}

/// Configuration for the `#[entity(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(entity), supports(struct_named))]
struct EntityArgs {
    ident: Ident,
    generics: syn::Generics,
    data: darling::ast::Data<darling::util::Ignored, EntityField>,
    #[darling(default)]
    kind: Option<String>,
    /// Field holding the entity identifier (defaults to a field named `id`).
    #[darling(default)]
    id_field: Option<TypePath>,
}

#[derive(Debug, FromField)]
struct EntityField {
    ident: Option<Ident>,
    ty: syn::Type,
}

/// Configuration for the `#[converter(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(converter), supports(struct_any))]
struct ConverterArgs {
    ident: Ident,
    vis: syn::Visibility,
    generics: syn::Generics,
    /// Source domain event type the conversion rule declares.
    event: TypePath,
}

/// Semantics a field carries for stamping, recognised by its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRole {
    Version,
    OptionVersion,
    Timestamp,
    OptionTimestamp,
    Events,
    Plain,
}

/// Classify a field by the last segment of its type path, unwrapping one
/// level of `Option<...>`.
fn classify(ty: &syn::Type) -> FieldRole {
    fn last_segment(ty: &syn::Type) -> Option<&syn::PathSegment> {
        match ty {
            syn::Type::Path(path) if path.qself.is_none() => path.path.segments.last(),
            _ => None,
        }
    }

    let Some(segment) = last_segment(ty) else {
        return FieldRole::Plain;
    };
    match segment.ident.to_string().as_str() {
        "RowVersion" => FieldRole::Version,
        "UpdateTime" => FieldRole::Timestamp,
        "DomainEvents" => FieldRole::Events,
        "Option" => {
            let PathArguments::AngleBracketed(args) = &segment.arguments else {
                return FieldRole::Plain;
            };
            let Some(GenericArgument::Type(inner)) = args.args.first() else {
                return FieldRole::Plain;
            };
            match last_segment(inner).map(|s| s.ident.to_string()) {
                Some(name) if name == "RowVersion" => FieldRole::OptionVersion,
                Some(name) if name == "UpdateTime" => FieldRole::OptionTimestamp,
                _ => FieldRole::Plain,
            }
        }
        _ => FieldRole::Plain,
    }
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// Derives the `Entity` and `Stamped` traits for a struct.
///
/// The macro reads the struct's declared field types to resolve, at compile
/// time, which fields carry concurrency semantics: the declarative
/// replacement for scanning entity fields at runtime:
///
/// - `RowVersion` (or `Option<RowVersion>`) fields advance by one on every
///   modifying save unless the caller set them explicitly; an unset
///   `Option<RowVersion>` original initialises to version 0
/// - `UpdateTime` (or `Option<UpdateTime>`) fields are unconditionally
///   refreshed to the save's UTC instant
/// - a `DomainEvents` field becomes the entity's event buffer, wired to
///   `Entity::domain_events`
///
/// # Attributes
///
/// ## Optional
/// - `kind = "name"` - Entity type identifier (default: kebab-case struct
///   name)
/// - `id_field = field` - Field holding the entity identifier (default: the
///   field named `id`)
///
/// # Example
///
/// ```ignore
/// #[derive(Entity, Serialize, Clone)]
/// #[entity(kind = "order")]
/// struct Order {
///     id: String,
///     amount: i64,
///     version: RowVersion,
///     updated_at: UpdateTime,
///     #[serde(skip)]
///     events: DomainEvents,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_entity_impl(&input).into()
}

/// Internal entry point that returns tokens for the entity derive.
fn derive_entity_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EntityArgs, _>(input, |args| generate_entity_impl(&args))
}

/// Generate the entity derive implementation tokens.
fn generate_entity_impl(args: &EntityArgs) -> TokenStream2 {
    let struct_name = &args.ident;
    let fields = args
        .data
        .as_ref()
        .take_struct()
        .expect("supports(struct_named) guarantees a struct")
        .fields;

    let id_ident = match &args.id_field {
        Some(TypePath(path)) => match path.get_ident() {
            Some(ident) => ident.clone(),
            None => {
                return darling::Error::custom("`id_field` must name a field of this struct")
                    .with_span(&args.ident)
                    .write_errors();
            }
        },
        None => format_ident!("id"),
    };
    let Some(id_field) = fields
        .iter()
        .find(|field| field.ident.as_ref() == Some(&id_ident))
    else {
        return darling::Error::custom(format!(
            "no `{id_ident}` field found; add one or set `#[entity(id_field = ...)]`"
        ))
        .with_span(&args.ident)
        .write_errors();
    };
    let id_type = &id_field.ty;

    let kind = default_kind(struct_name, args.kind.clone());
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();

    let mut stamp_statements = Vec::new();
    let mut row_version_body = quote! { None };
    let mut events_field: Option<&Ident> = None;
    let mut uses_original = false;
    let mut uses_now = false;
    let mut version_seen = false;

    for field in &fields {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        match classify(&field.ty) {
            FieldRole::Version => {
                uses_original = true;
                stamp_statements.push(quote! {
                    if let Some(original) = original {
                        if self.#ident == original.#ident {
                            self.#ident = original.#ident.next();
                        }
                    }
                });
                if !version_seen {
                    row_version_body = quote! { Some(self.#ident) };
                    version_seen = true;
                }
            }
            FieldRole::OptionVersion => {
                uses_original = true;
                stamp_statements.push(quote! {
                    if let Some(original) = original {
                        if self.#ident == original.#ident {
                            self.#ident = Some(match original.#ident {
                                Some(version) => version.next(),
                                None => ::savepoint::RowVersion::new(0),
                            });
                        }
                    }
                });
                if !version_seen {
                    row_version_body = quote! { self.#ident };
                    version_seen = true;
                }
            }
            FieldRole::Timestamp => {
                uses_now = true;
                stamp_statements.push(quote! { self.#ident = now; });
            }
            FieldRole::OptionTimestamp => {
                uses_now = true;
                stamp_statements.push(quote! { self.#ident = Some(now); });
            }
            FieldRole::Events => {
                if events_field.is_none() {
                    events_field = Some(ident);
                }
            }
            FieldRole::Plain => {}
        }
    }

    let original_param = if uses_original {
        format_ident!("original")
    } else {
        format_ident!("_original")
    };
    let now_param = if uses_now {
        format_ident!("now")
    } else {
        format_ident!("_now")
    };

    let domain_events_fn = events_field.map(|ident| {
        quote! {
            fn domain_events(&mut self) -> Option<&mut ::savepoint::DomainEvents> {
                Some(&mut self.#ident)
            }
        }
    });

    quote! {
        impl #impl_generics ::savepoint::Entity for #struct_name #ty_generics #where_clause {
            const KIND: &'static str = #kind;
            type Id = #id_type;

            fn id(&self) -> &Self::Id {
                &self.#id_ident
            }

            #domain_events_fn
        }

        impl #impl_generics ::savepoint::Stamped for #struct_name #ty_generics #where_clause {
            fn stamp(&mut self, #original_param: Option<&Self>, #now_param: ::savepoint::UpdateTime) {
                #(#stamp_statements)*
            }

            fn row_version(&self) -> Option<::savepoint::RowVersion> {
                #row_version_body
            }
        }
    }
}

/// Derives a domain-event handler for an integration event conversion rule.
///
/// Given a type implementing `IntegrationEventConvert<E>` for the domain
/// event `E` declared in `#[converter(event = E)]`, this macro synthesizes a
/// handler type, named deterministically `{ConversionType}Handler`, that
/// receives `E`, invokes the conversion, and publishes the result through the
/// configured [`IntegrationEventPublisher`]. Register it like any other
/// handler:
///
/// ```ignore
/// #[derive(EventConverter)]
/// #[converter(event = OrderPaid)]
/// struct OrderPaidConverter;
///
/// impl IntegrationEventConvert<OrderPaid> for OrderPaidConverter {
///     type Output = OrderPaidIntegrationEvent;
///
///     fn convert(&self, event: &OrderPaid) -> Self::Output {
///         OrderPaidIntegrationEvent { order_id: event.order_id.clone() }
///     }
/// }
///
/// registry.register::<OrderPaid, _>(OrderPaidConverterHandler::new(
///     OrderPaidConverter,
///     publisher.clone(),
/// ));
/// ```
///
/// [`IntegrationEventPublisher`]: trait.IntegrationEventPublisher.html
#[proc_macro_derive(EventConverter, attributes(converter))]
pub fn derive_event_converter(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_event_converter_impl(&input).into()
}

/// Internal entry point that returns tokens for the converter derive.
fn derive_event_converter_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<ConverterArgs, _>(input, generate_event_converter_impl)
}

/// Generate the converter derive implementation tokens.
fn generate_event_converter_impl(args: ConverterArgs) -> TokenStream2 {
    if !args.generics.params.is_empty() {
        return darling::Error::custom("generic conversion types are not supported")
            .with_span(&args.ident)
            .write_errors();
    }

    let convert_type = &args.ident;
    let vis = &args.vis;
    let event_type = &args.event.0;
    let handler_name = format_ident!("{}Handler", convert_type);

    quote! {
        #[doc = concat!(
            "Domain-event handler generated for the [`",
            stringify!(#convert_type),
            "`] conversion rule."
        )]
        #vis struct #handler_name<P> {
            convert: #convert_type,
            publisher: P,
        }

        impl<P> #handler_name<P> {
            #vis fn new(convert: #convert_type, publisher: P) -> Self {
                Self { convert, publisher }
            }
        }

        #[::savepoint::async_trait]
        impl<P> ::savepoint::DomainEventHandler<#event_type> for #handler_name<P>
        where
            P: ::savepoint::IntegrationEventPublisher + 'static,
            #convert_type: ::savepoint::IntegrationEventConvert<#event_type>,
        {
            async fn handle(
                &self,
                notification: &#event_type,
                _context: &mut ::savepoint::SaveContext<'_>,
                cancellation: &::savepoint::CancellationToken,
            ) -> Result<(), ::savepoint::BoxError> {
                let integration_event =
                    ::savepoint::IntegrationEventConvert::convert(&self.convert, notification);
                ::savepoint::IntegrationEventPublisherExt::publish_event(
                    &self.publisher,
                    &integration_event,
                    cancellation,
                )
                .await?;
                Ok(())
            }
        }
    }
}
