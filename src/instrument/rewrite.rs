//! Region discovery and hit-call insertion.
//!
//! Item-level recursion decides which function bodies are instrumented; a
//! [`VisitMut`] then walks each body and prepends a hit call to every block.
//! Const contexts are never entered: a call to the (non-`const`) hit function
//! there would not compile.

use proc_macro2::Span;
use quote::format_ident;
use syn::punctuated::Punctuated;
use syn::visit_mut::{self, VisitMut};
use syn::{
    Attribute, Block, ExprConst, ExprRepeat, GenericArgument, ImplItem, Item, Meta, Pat, Signature, Stmt, Token,
    TraitItem, Type, parse_quote,
};

use super::HIT_FN;

/// Line of each region's opening brace, indexed by region.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegionTable {
    lines: Vec<u32>,
}

impl RegionTable {
    fn push(&mut self, line: u32) -> usize {
        self.lines.push(line);
        self.lines.len() - 1
    }

    pub fn lines(&self) -> &[u32] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Instrument every eligible function in `items`.
///
/// `depth` is the inline-module nesting level; calls inside nested modules
/// reach the file-level hit function through `super::`.
pub fn rewrite_items(items: &mut [Item], depth: usize, regions: &mut RegionTable) {
    for item in items {
        match item {
            Item::Fn(f) => {
                if instrumentable(&f.attrs, &f.sig) {
                    rewrite_body(&mut f.block, depth, regions);
                }
            }
            Item::Impl(imp) if !is_test_only(&imp.attrs) => {
                for impl_item in &mut imp.items {
                    if let ImplItem::Fn(method) = impl_item {
                        if instrumentable(&method.attrs, &method.sig) {
                            rewrite_body(&mut method.block, depth, regions);
                        }
                    }
                }
            }
            Item::Trait(tr) if !is_test_only(&tr.attrs) => {
                for trait_item in &mut tr.items {
                    let TraitItem::Fn(method) = trait_item else {
                        continue;
                    };
                    if !instrumentable(&method.attrs, &method.sig) {
                        continue;
                    }
                    if let Some(block) = &mut method.default {
                        rewrite_body(block, depth, regions);
                    }
                }
            }
            Item::Mod(module) if !is_test_only(&module.attrs) => {
                if let Some((_, content)) = &mut module.content {
                    rewrite_items(content, depth + 1, regions);
                }
            }
            _ => {}
        }
    }
}

fn rewrite_body(block: &mut Block, depth: usize, regions: &mut RegionTable) {
    let hit_path = hit_path(depth);
    let mut rewriter = BlockRewriter { regions, hit_path };
    rewriter.visit_block_mut(block);
}

/// `__covkit_hit`, `super::__covkit_hit`, `super::super::__covkit_hit`, ...
fn hit_path(depth: usize) -> syn::Path {
    let hit = format_ident!("{}", HIT_FN);
    let mut path: syn::Path = parse_quote!(#hit);
    for _ in 0..depth {
        path.segments.insert(0, parse_quote!(super));
    }
    path
}

struct BlockRewriter<'a> {
    regions: &'a mut RegionTable,
    hit_path: syn::Path,
}

impl VisitMut for BlockRewriter<'_> {
    fn visit_block_mut(&mut self, block: &mut Block) {
        let line = line_of(block.brace_token.span.open());
        let region = self.regions.push(line);

        visit_mut::visit_block_mut(self, block);

        let hit = &self.hit_path;
        let stmt: Stmt = parse_quote!(#hit(#region););
        block.stmts.insert(0, stmt);
    }

    // nested items are separate scopes with their own rules
    fn visit_item_mut(&mut self, _item: &mut Item) {}

    // const contexts
    fn visit_expr_const_mut(&mut self, _expr: &mut ExprConst) {}
    fn visit_generic_argument_mut(&mut self, _arg: &mut GenericArgument) {}
    fn visit_type_mut(&mut self, _ty: &mut Type) {}
    fn visit_pat_mut(&mut self, _pat: &mut Pat) {}

    fn visit_expr_repeat_mut(&mut self, expr: &mut ExprRepeat) {
        // the length is a const context, the element is not
        self.visit_expr_mut(&mut expr.expr);
    }
}

fn line_of(span: Span) -> u32 {
    u32::try_from(span.start().line).unwrap_or(u32::MAX)
}

fn instrumentable(attrs: &[Attribute], sig: &Signature) -> bool {
    sig.constness.is_none() && !is_test_only(attrs) && !is_naked(attrs)
}

/// Test functions, benchmarks, and items whose `cfg` only holds in test builds.
///
/// `cfg(test)` and `cfg(all(.., test, ..))` are test-only; `cfg(not(test))`
/// is not. The same rule decides which `mod name;` declarations are followed
/// during member discovery.
pub fn is_test_only(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        let path = attr.path();
        if path.segments.last().is_some_and(|s| s.ident == "test" || s.ident == "bench") {
            return true;
        }
        path.is_ident("cfg") && attr.parse_args::<Meta>().is_ok_and(|predicate| requires_test(&predicate))
    })
}

/// Whether a `cfg` predicate can only be true when compiling tests.
fn requires_test(predicate: &Meta) -> bool {
    match predicate {
        Meta::Path(path) => path.is_ident("test"),
        Meta::List(list) => {
            let Ok(nested) = list.parse_args_with(Punctuated::<Meta, Token![,]>::parse_terminated) else {
                return false;
            };
            if list.path.is_ident("all") {
                nested.iter().any(requires_test)
            } else if list.path.is_ident("any") {
                !nested.is_empty() && nested.iter().all(requires_test)
            } else {
                false
            }
        }
        Meta::NameValue(_) => false,
    }
}

/// `#[naked]` or the edition 2024 `#[unsafe(naked)]`.
fn is_naked(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        let path = attr.path();
        if path.is_ident("naked") {
            return true;
        }
        match &attr.meta {
            Meta::List(list) if path.is_ident("unsafe") => {
                list.parse_args::<Meta>().is_ok_and(|inner| inner.path().is_ident("naked"))
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(source: &str) -> (syn::File, RegionTable) {
        let mut file = syn::parse_file(source).unwrap();
        let mut regions = RegionTable::default();
        rewrite_items(&mut file.items, 0, &mut regions);
        (file, regions)
    }

    fn render(file: &syn::File) -> String {
        prettyplease::unparse(file)
    }

    #[test]
    fn test_function_body_is_one_region() {
        let (file, regions) = rewrite("fn answer() -> i32 {\n    42\n}\n");
        assert_eq!(regions.lines(), &[1]);
        assert!(render(&file).contains("__covkit_hit(0usize);"));
    }

    #[test]
    fn test_nested_blocks_numbered_in_preorder() {
        let source = "\
fn classify(x: i32) -> &'static str {
    if x > 0 {
        \"pos\"
    } else {
        loop {
            break \"non-pos\";
        }
    }
}
";
        let (file, regions) = rewrite(source);
        assert_eq!(regions.lines(), &[1, 2, 4, 5]);
        let text = render(&file);
        for region in 0..4 {
            assert!(text.contains(&format!("__covkit_hit({region}usize);")), "{text}");
        }
    }

    #[test]
    fn test_skips_const_fn_and_test_items() {
        let source = "
const fn size() -> usize { 4 }
#[test]
fn unit() { assert!(true); }
#[cfg(test)]
mod tests { fn helper() {} }
#[cfg(all(unix, test))]
fn gated() {}
";
        let (_, regions) = rewrite(source);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_methods_and_trait_defaults_are_instrumented() {
        let source = "
struct S;
impl S {
    fn a(&self) {}
    const fn b() -> u8 { 0 }
}
trait T {
    fn required(&self);
    fn provided(&self) {}
}
";
        let (_, regions) = rewrite(source);
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_inline_module_uses_super_path() {
        let (file, regions) = rewrite("mod inner { pub mod deeper { pub fn f() {} } }");
        assert_eq!(regions.len(), 1);
        assert!(render(&file).contains("super::super::__covkit_hit(0usize);"));
    }

    #[test]
    fn test_const_contexts_are_left_alone() {
        let source = "
fn f() -> [u8; 4] {
    const N: usize = { 2 + 2 };
    let _ = const { 1 };
    let v = g::<{ 1 + 1 }>();
    let _ = v;
    [{ 0 }; { 4 }]
}
fn g<const K: usize>() -> usize { K }
";
        let (file, regions) = rewrite(source);
        // f body, the array element block, g body
        assert_eq!(regions.len(), 3);
        let text = render(&file);
        assert_eq!(text.matches("__covkit_hit(").count(), 3, "{text}");
        syn::parse_file(&text).unwrap();
    }

    #[test]
    fn test_closure_and_match_blocks() {
        let source = "
fn f(v: Option<i32>) -> i32 {
    let add = |x: i32| { x + 1 };
    match v {
        Some(x) => { add(x) }
        None => 0,
    }
}
";
        let (_, regions) = rewrite(source);
        assert_eq!(regions.len(), 3);
    }

    #[test]
    fn test_is_test_only_recognizes_attribute_forms() {
        let item: syn::ItemFn = parse_quote! {
            #[tokio::test]
            async fn t() {}
        };
        assert!(is_test_only(&item.attrs));

        let item: syn::ItemFn = parse_quote! {
            #[cfg(feature = "x")]
            fn f() {}
        };
        assert!(!is_test_only(&item.attrs));
    }

    #[test]
    fn test_cfg_test_rule_evaluates_the_predicate() {
        let gated = |attr: &str| {
            let item: syn::ItemFn = syn::parse_str(&format!("{attr}\nfn f() {{}}")).unwrap();
            is_test_only(&item.attrs)
        };
        assert!(gated("#[cfg(test)]"));
        assert!(gated("#[cfg(all(unix, test))]"));
        assert!(gated("#[cfg(any(test, all(test, unix)))]"));
        assert!(!gated("#[cfg(not(test))]"));
        assert!(!gated("#[cfg(any(test, feature = \"testing\"))]"));
        assert!(!gated("#[cfg(all(unix, not(test)))]"));
    }

    #[test]
    fn test_not_test_items_are_instrumented() {
        let source = "
#[cfg(not(test))]
fn production() {}
#[cfg(not(test))]
mod real { pub fn f() {} }
";
        let (_, regions) = rewrite(source);
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_naked_functions_are_skipped_in_both_spellings() {
        let source = "
#[naked]
extern \"C\" fn old_style() {}
#[unsafe(naked)]
extern \"C\" fn edition_2024() {}
#[unsafe(no_mangle)]
extern \"C\" fn exported() {}
";
        let (_, regions) = rewrite(source);
        assert_eq!(regions.lines(), &[7]);
    }
}
