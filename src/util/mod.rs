pub mod range;

#[cfg(any(test, feature = "__internal_doc_test"))]
pub mod test;
