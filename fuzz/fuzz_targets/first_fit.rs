#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use palloc::StrategyKind;
use palloc_hater::{AllocatorOp, PallocSubject};

const MAX_PAGES: usize = 1024;

#[derive(Clone, Debug)]
struct Args {
    num_pages: usize,
    user_page_limit: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let num_pages = usize::arbitrary(un)? % MAX_PAGES;
        let user_page_limit = usize::arbitrary(un)?;
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            num_pages,
            user_page_limit,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        num_pages,
        user_page_limit,
        ops,
    } = args;

    let subject = match PallocSubject::new(StrategyKind::FirstFit, num_pages, user_page_limit) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = palloc_hater::Evaluator::new(subject);
    eval.evaluate(ops).unwrap();
});
